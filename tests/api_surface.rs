//! The HTTP façade end to end: submit through the client, watch the job
//! finish, and read back everything `describe` needs.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{DevStack, DevStackOptions};
use flotilla::api::{serve_api, ApiClient, ApiState};
use flotilla::config::ApiConfig;
use flotilla::executor::{NoopExecutor, RunShardHook};
use flotilla::job::{
    EngineKind, JobDeal, JobSpec, JobSpecDocker, JobSpecSharding, ResourceUsageConfig,
    VerifierKind,
};
use flotilla::{FlotillaError, JobStateKind};

fn echo_spec() -> JobSpec {
    JobSpec {
        engine: EngineKind::Noop,
        verifier: VerifierKind::Blob,
        resources: ResourceUsageConfig::default(),
        docker: JobSpecDocker {
            image: "alpine".into(),
            entrypoint: vec!["echo".into(), "hi".into()],
            env: vec![],
        },
        inputs: vec![],
        outputs: vec![],
        workdir: String::new(),
        annotations: vec![],
        sharding: JobSpecSharding::default(),
    }
}

async fn start_api(stack: &DevStack) -> ApiClient {
    let addr = serve_api(
        &ApiConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        ApiState {
            controller: stack.nodes[0].controller.clone(),
        },
        stack.shutdown.token(),
    )
    .await
    .unwrap();
    ApiClient::new(format!("http://{}", addr))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_submit_and_describe_through_api() {
    let hook: RunShardHook = Arc::new(|_job, _shard, _volumes, dir| {
        NoopExecutor::write_result_files(dir, "hi\n", "", 0)
    });
    let stack = DevStack::new(DevStackOptions {
        run_hook: Some(hook),
        ..Default::default()
    });
    let client = start_api(&stack).await;

    let submitted = client
        .submit(echo_spec(), JobDeal { concurrency: 1, assigned_nodes: vec![] }, "tester")
        .await
        .unwrap();

    // Round-trip: the job we read back carries the spec we submitted.
    let fetched = client.get(&submitted.id.to_string()).await.unwrap();
    assert_eq!(fetched.spec, echo_spec());
    assert_eq!(fetched.client_id.to_string(), "tester");

    // Short ids resolve too.
    let short = &submitted.id.to_string()[..8];
    assert_eq!(client.get(short).await.unwrap().id, submitted.id);

    // Wait for completion through the client.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let state = client.get_job_state(&submitted.id.to_string()).await.unwrap();
        if state.kind == JobStateKind::Complete {
            break;
        }
        assert!(Instant::now() < deadline, "job did not complete in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let events = client.get_events(&submitted.id.to_string()).await.unwrap();
    assert!(!events.is_empty());
    let local_events = client
        .get_local_events(&submitted.id.to_string())
        .await
        .unwrap();
    assert!(!local_events.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_job_is_not_found() {
    let stack = DevStack::single_node();
    let client = start_api(&stack).await;
    let err = client.get("ffffffff").await.unwrap_err();
    assert!(matches!(err, FlotillaError::NotFound(_)));
}
