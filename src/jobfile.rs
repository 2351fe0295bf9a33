//! # Job Files
//!
//! Parsing and validation of submitted `job.json` / `job.yaml` files.
//! The file extension selects the parser; validation happens entirely
//! before anything is published, so a bad spec never produces events.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::job::{
    EngineKind, JobDeal, JobSpec, JobSpecDocker, JobSpecSharding, ResourceUsageConfig,
    StorageSourceKind, StorageSpec, VerifierKind,
};
use crate::storage::UrlDownloadProvider;
use crate::types::{FlotillaError, FlotillaResult};

/// The on-disk job description, field names as users write them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFile {
    #[serde(rename = "EngineName", default)]
    pub engine_name: String,
    #[serde(rename = "VerifierName", default)]
    pub verifier_name: String,
    #[serde(rename = "Docker", default)]
    pub docker: JobFileDocker,
    #[serde(rename = "Resources", default)]
    pub resources: JobFileResources,
    #[serde(rename = "Inputs", default)]
    pub inputs: Vec<JobFileInput>,
    #[serde(rename = "Outputs", default)]
    pub outputs: Vec<JobFileOutput>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: String,
    #[serde(rename = "Sharding", default)]
    pub sharding: JobFileSharding,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFileDocker {
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Vec<String>,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFileResources {
    #[serde(rename = "CPU", default)]
    pub cpu: String,
    #[serde(rename = "Memory", default)]
    pub memory: String,
    #[serde(rename = "GPU", default)]
    pub gpu: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFileInput {
    #[serde(rename = "EngineName", default)]
    pub engine_name: String,
    #[serde(rename = "Cid", default)]
    pub cid: String,
    #[serde(rename = "URL", default)]
    pub url: String,
    #[serde(rename = "Path", default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFileOutput {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Path", default)]
    pub path: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobFileSharding {
    #[serde(rename = "BatchSize", default)]
    pub batch_size: u32,
}

/// Read and parse a job file; `.json`, `.yaml` and `.yml` are accepted.
pub fn parse_job_file(path: &Path) -> FlotillaResult<JobFile> {
    let content = std::fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match extension {
        "json" => serde_json::from_str(&content)
            .map_err(|e| FlotillaError::BadSpec(format!("invalid json job file: {}", e))),
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .map_err(|e| FlotillaError::BadSpec(format!("invalid yaml job file: {}", e))),
        other => Err(FlotillaError::BadSpec(format!(
            "unsupported job file extension {:?} (want .json, .yaml or .yml)",
            other
        ))),
    }
}

/// Annotations keep `a-zA-Z0-9 _ : | -` and lose everything else.
fn sanitize_annotation(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '|' | '-'))
        .collect()
}

/// Validate a parsed job file and build the spec/deal pair to submit.
/// Every check lands before publication: a failure here means no
/// `JobCreated` was ever emitted.
pub fn construct_job(
    file: &JobFile,
    concurrency: u32,
    labels: &[String],
) -> FlotillaResult<(JobSpec, JobDeal)> {
    let engine = EngineKind::parse(&file.engine_name)
        .ok_or_else(|| FlotillaError::BadSpec(format!("unknown engine {:?}", file.engine_name)))?;
    let verifier = VerifierKind::parse(&file.verifier_name).ok_or_else(|| {
        FlotillaError::BadSpec(format!("unknown verifier {:?}", file.verifier_name))
    })?;

    if file.docker.image.is_empty() {
        return Err(FlotillaError::BadSpec("empty container image".into()));
    }
    if concurrency == 0 {
        return Err(FlotillaError::BadSpec("concurrency must be positive".into()));
    }
    if !file.working_dir.is_empty() && !file.working_dir.starts_with('/') {
        return Err(FlotillaError::BadSpec(format!(
            "working dir {:?} must be an absolute path",
            file.working_dir
        )));
    }

    let mut inputs = Vec::with_capacity(file.inputs.len());
    for input in &file.inputs {
        let kind = StorageSourceKind::parse(&input.engine_name).ok_or_else(|| {
            FlotillaError::BadSpec(format!("unknown storage source {:?}", input.engine_name))
        })?;
        if input.path.is_empty() {
            return Err(FlotillaError::BadSpec(format!(
                "empty volume mount point for input {:?}",
                input
            )));
        }
        match kind {
            StorageSourceKind::Ipfs => {
                if input.cid.is_empty() {
                    return Err(FlotillaError::BadSpec(format!(
                        "empty cid for input {:?}",
                        input
                    )));
                }
            }
            StorageSourceKind::UrlDownload => {
                if input.url.is_empty() {
                    return Err(FlotillaError::BadSpec(format!(
                        "empty url for input {:?}",
                        input
                    )));
                }
                UrlDownloadProvider::is_url_supported(&input.url)?;
            }
        }
        inputs.push(StorageSpec {
            engine: Some(kind),
            name: String::new(),
            cid: input.cid.clone(),
            url: input.url.clone(),
            path: input.path.clone(),
        });
    }

    let mut outputs: Vec<StorageSpec> = file
        .outputs
        .iter()
        .map(|o| StorageSpec {
            engine: None,
            name: o.name.clone(),
            cid: String::new(),
            url: String::new(),
            path: o.path.clone(),
        })
        .collect();
    // Every job gets the synthetic default output.
    outputs.push(StorageSpec {
        engine: None,
        name: "outputs".to_string(),
        cid: String::new(),
        url: String::new(),
        path: "/outputs".to_string(),
    });

    let annotations: Vec<String> = labels
        .iter()
        .map(|l| sanitize_annotation(l))
        .filter(|l| !l.is_empty())
        .collect();

    let spec = JobSpec {
        engine,
        verifier,
        resources: ResourceUsageConfig {
            cpu: file.resources.cpu.clone(),
            memory: file.resources.memory.clone(),
            gpu: file.resources.gpu.clone(),
        },
        docker: JobSpecDocker {
            image: file.docker.image.clone(),
            entrypoint: file.docker.entrypoint.clone(),
            env: file.docker.env.clone(),
        },
        inputs,
        outputs,
        workdir: file.working_dir.clone(),
        annotations,
        sharding: JobSpecSharding {
            batch_size: file.sharding.batch_size,
        },
    };
    let deal = JobDeal {
        concurrency,
        assigned_nodes: Vec::new(),
    };
    Ok((spec, deal))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_file() -> JobFile {
        JobFile {
            engine_name: "docker".into(),
            verifier_name: "noop".into(),
            docker: JobFileDocker {
                image: "alpine".into(),
                entrypoint: vec!["echo".into(), "hi".into()],
                env: vec![],
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_job_constructs() {
        let (spec, deal) = construct_job(&minimal_file(), 1, &[]).unwrap();
        assert_eq!(spec.engine, EngineKind::Docker);
        assert_eq!(deal.concurrency, 1);
        // The synthetic default output is always appended.
        assert_eq!(spec.outputs.len(), 1);
        assert_eq!(spec.outputs[0].name, "outputs");
        assert_eq!(spec.outputs[0].path, "/outputs");
    }

    #[test]
    fn test_unknown_engine_is_bad_spec() {
        let mut file = minimal_file();
        file.engine_name = "warpdrive".into();
        assert!(matches!(
            construct_job(&file, 1, &[]),
            Err(FlotillaError::BadSpec(_))
        ));
    }

    #[test]
    fn test_empty_image_is_bad_spec() {
        let mut file = minimal_file();
        file.docker.image = String::new();
        assert!(matches!(
            construct_job(&file, 1, &[]),
            Err(FlotillaError::BadSpec(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_is_bad_spec() {
        assert!(matches!(
            construct_job(&minimal_file(), 0, &[]),
            Err(FlotillaError::BadSpec(_))
        ));
    }

    #[test]
    fn test_ftp_url_input_is_bad_spec() {
        let mut file = minimal_file();
        file.inputs.push(JobFileInput {
            engine_name: "url".into(),
            url: "ftp://x".into(),
            path: "/in".into(),
            ..Default::default()
        });
        assert!(matches!(
            construct_job(&file, 1, &[]),
            Err(FlotillaError::BadSpec(_))
        ));
    }

    #[test]
    fn test_input_invariants() {
        // Missing mount path.
        let mut file = minimal_file();
        file.inputs.push(JobFileInput {
            engine_name: "ipfs".into(),
            cid: "Qmabc".into(),
            ..Default::default()
        });
        assert!(construct_job(&file, 1, &[]).is_err());

        // Missing cid for an ipfs input.
        let mut file = minimal_file();
        file.inputs.push(JobFileInput {
            engine_name: "ipfs".into(),
            path: "/in".into(),
            ..Default::default()
        });
        assert!(construct_job(&file, 1, &[]).is_err());

        // Well-formed ipfs input passes.
        let mut file = minimal_file();
        file.inputs.push(JobFileInput {
            engine_name: "ipfs".into(),
            cid: "Qmabc".into(),
            path: "/in".into(),
            ..Default::default()
        });
        let (spec, _) = construct_job(&file, 1, &[]).unwrap();
        assert_eq!(spec.inputs.len(), 1);
        assert_eq!(spec.inputs[0].engine, Some(StorageSourceKind::Ipfs));
    }

    #[test]
    fn test_annotations_are_sanitized() {
        let labels = vec!["ok-label_1".to_string(), "dr✗op:this✗".to_string()];
        let (spec, _) = construct_job(&minimal_file(), 1, &labels).unwrap();
        assert_eq!(spec.annotations, vec!["ok-label_1", "drop:this"]);
    }

    #[test]
    fn test_parse_selects_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("job.json");
        std::fs::write(
            &json,
            r#"{"EngineName":"docker","VerifierName":"noop","Docker":{"Image":"alpine","Entrypoint":["echo","hi"]}}"#,
        )
        .unwrap();
        let parsed = parse_job_file(&json).unwrap();
        assert_eq!(parsed.engine_name, "docker");
        assert_eq!(parsed.docker.entrypoint, vec!["echo", "hi"]);

        let yaml = dir.path().join("job.yaml");
        std::fs::write(
            &yaml,
            "EngineName: docker\nVerifierName: noop\nDocker:\n  Image: alpine\n  Entrypoint: [echo, hi]\n",
        )
        .unwrap();
        let parsed = parse_job_file(&yaml).unwrap();
        assert_eq!(parsed.docker.image, "alpine");

        let txt = dir.path().join("job.txt");
        std::fs::write(&txt, "nope").unwrap();
        assert!(matches!(
            parse_job_file(&txt),
            Err(FlotillaError::BadSpec(_))
        ));
    }
}
