//! Deploy, package, sync and status flows against the in-memory cloud

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stackherd::Deployer;
use stackherd::config::EngineConfig;
use stackherd::deployer::NOT_DEPLOYED;
use stackherd_common::tags::TAG_ROOT_STACK_NAME;
use stackherd_test_utils::fixtures::PLAIN_TEMPLATE;
use stackherd_test_utils::{FakeCloud, TemplateTree, function_tree, output_ref, stack_config};

const REGION: &str = "eu-west-1";

const APP_TEMPLATE: &str = r#"Parameters:
  QueueUrl:
    Type: String
Resources:
  Topic:
    Type: AWS::SNS::Topic
"#;

fn deployer(cloud: &Arc<FakeCloud>) -> Deployer {
    let config = EngineConfig {
        poll_interval: Duration::from_millis(1),
        ..Default::default()
    };
    Deployer::new(cloud.services(), &config)
}

#[tokio::test]
async fn test_deploy_follows_output_references() {
    let cloud = FakeCloud::new();
    cloud.plan_outputs(REGION, "network", &[("QueueUrl", "https://sqs/queue")]);
    let tree = TemplateTree::new();
    let network = tree.file("network.yaml", PLAIN_TEMPLATE);
    let app = tree.file("app.yaml", APP_TEMPLATE);

    // Listed dependent-first to show the order comes from the graph
    let stacks = vec![
        stack_config(
            REGION,
            "app",
            &app.display().to_string(),
            json!({ "parameters": { "QueueUrl": output_ref("network", "QueueUrl") } }),
        ),
        stack_config(REGION, "network", &network.display().to_string(), json!({})),
    ];

    let report = deployer(&cloud).deploy(&stacks).await.unwrap();
    assert!(report.is_success(), "{report:?}");
    assert_eq!(
        cloud.calls_matching("execute_change_set"),
        vec![
            "execute_change_set eu-west-1/network",
            "execute_change_set eu-west-1/app"
        ]
    );
    assert_eq!(
        cloud.stack_parameters(REGION, "app")["QueueUrl"],
        "https://sqs/queue"
    );
    assert_eq!(
        cloud.stack_status(REGION, "app").as_deref(),
        Some("CREATE_COMPLETE")
    );
}

#[tokio::test]
async fn test_redeploy_without_changes_executes_nothing() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    let template = tree.file("network.yaml", PLAIN_TEMPLATE);
    let stacks = vec![stack_config(
        REGION,
        "network",
        &template.display().to_string(),
        json!({ "tags": { "team": "infra" } }),
    )];
    let deployer = deployer(&cloud);

    assert!(deployer.deploy(&stacks).await.unwrap().is_success());
    assert!(deployer.deploy(&stacks).await.unwrap().is_success());

    assert_eq!(cloud.calls_matching("execute_change_set").len(), 1);
    assert_eq!(cloud.change_set_count(REGION, "network"), 0);
}

#[tokio::test]
async fn test_failed_deploy_blocks_dependents_and_reports_events() {
    let cloud = FakeCloud::new();
    cloud.fail_deploy(
        REGION,
        "network",
        "Queue",
        "AWS::SQS::Queue",
        "Resource limit reached",
    );
    let tree = TemplateTree::new();
    let network = tree.file("network.yaml", PLAIN_TEMPLATE);
    let app = tree.file("app.yaml", APP_TEMPLATE);
    let stacks = vec![
        stack_config(REGION, "network", &network.display().to_string(), json!({})),
        stack_config(
            REGION,
            "app",
            &app.display().to_string(),
            json!({ "parameters": { "QueueUrl": output_ref("network", "QueueUrl") } }),
        ),
    ];

    let report = deployer(&cloud).deploy(&stacks).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    let (failed, error) = &report.failed[0];
    assert_eq!(failed.name, "network");
    let message = format!("{error:#}");
    assert!(message.contains("Queue"), "{message}");
    assert!(message.contains("Resource limit reached"), "{message}");

    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].name, "app");
    assert!(cloud.calls_matching("create_change_set eu-west-1/app").is_empty());
}

#[tokio::test]
async fn test_change_set_limit_is_retried() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    let template = tree.file("network.yaml", PLAIN_TEMPLATE);
    let stacks = vec![stack_config(
        REGION,
        "network",
        &template.display().to_string(),
        json!({}),
    )];

    cloud.limit_change_sets(2);
    let report = deployer(&cloud).deploy(&stacks).await.unwrap();
    assert!(report.is_success(), "{report:?}");
    assert_eq!(cloud.calls_matching("create_change_set").len(), 3);
}

#[tokio::test]
async fn test_change_set_limit_gives_up() {
    let cloud = FakeCloud::new();
    let tree = TemplateTree::new();
    let template = tree.file("network.yaml", PLAIN_TEMPLATE);
    let stacks = vec![stack_config(
        REGION,
        "network",
        &template.display().to_string(),
        json!({}),
    )];

    cloud.limit_change_sets(3);
    let report = deployer(&cloud).deploy(&stacks).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(cloud.calls_matching("create_change_set").len(), 3);
    assert!(cloud.stack_status(REGION, "network").is_none());
}

#[tokio::test]
async fn test_deploy_packages_artifacts_in_dependency_order() {
    let cloud = FakeCloud::new();
    let tree = function_tree();
    let stacks = vec![stack_config(
        REGION,
        "app",
        &tree.path("template.yaml").display().to_string(),
        json!({ "bucket": "artifacts" }),
    )];
    let deployer = deployer(&cloud);

    let report = deployer.deploy(&stacks).await.unwrap();
    assert!(report.is_success(), "{report:?}");

    let uploads = cloud.calls_matching("put_object ");
    assert_eq!(uploads.len(), 4, "{uploads:?}");
    assert!(uploads[0].ends_with(".zip"));
    assert!(uploads[1].ends_with(".zip"));
    assert!(uploads[2].ends_with(".yaml"));
    assert!(uploads[3].ends_with(".yaml"));

    for key in cloud.object_keys("artifacts") {
        assert_eq!(
            cloud.object_tags("artifacts", &key)[TAG_ROOT_STACK_NAME],
            "app"
        );
    }

    // Same content, same keys: nothing is uploaded or executed twice
    assert!(deployer.deploy(&stacks).await.unwrap().is_success());
    assert_eq!(cloud.calls_matching("put_object ").len(), 4);
    assert_eq!(cloud.calls_matching("execute_change_set").len(), 1);
}

#[tokio::test]
async fn test_deploy_writes_outputs_file() {
    let cloud = FakeCloud::new();
    cloud.plan_outputs(REGION, "network", &[("QueueUrl", "https://sqs/queue")]);
    let tree = TemplateTree::new();
    let template = tree.file("network.yaml", PLAIN_TEMPLATE);
    let outputs = tree.path("out/network.json");
    let stacks = vec![stack_config(
        REGION,
        "network",
        &template.display().to_string(),
        json!({ "outputsFile": outputs }),
    )];

    assert!(deployer(&cloud).deploy(&stacks).await.unwrap().is_success());

    let written: BTreeMap<String, String> =
        serde_json::from_str(&std::fs::read_to_string(&outputs).unwrap()).unwrap();
    assert_eq!(written["QueueUrl"], "https://sqs/queue");
}

#[tokio::test]
async fn test_pkg_uploads_without_deploying() {
    let cloud = FakeCloud::new();
    let tree = function_tree();
    let stacks = vec![stack_config(
        REGION,
        "app",
        &tree.path("template.yaml").display().to_string(),
        json!({ "bucket": "artifacts" }),
    )];

    let packaged = deployer(&cloud).pkg(&stacks).await.unwrap();

    assert_eq!(packaged.len(), 1);
    let url = packaged[0].url.as_deref().unwrap();
    assert!(url.starts_with("https://artifacts.s3.eu-west-1.amazonaws.com/"));
    assert!(packaged[0].body.contains("s3://artifacts/"));
    assert!(!packaged[0].body.contains("./src"));
    assert!(cloud.calls_matching("create_change_set").is_empty());
}

#[tokio::test]
async fn test_status_and_sync() {
    let cloud = FakeCloud::new();
    cloud.plan_outputs(REGION, "network", &[("QueueUrl", "https://sqs/queue")]);
    let tree = TemplateTree::new();
    let template = tree.file("network.yaml", PLAIN_TEMPLATE);
    let outputs = tree.path("network.json");
    let stacks = vec![stack_config(
        REGION,
        "network",
        &template.display().to_string(),
        json!({ "outputsFile": outputs }),
    )];
    let deployer = deployer(&cloud);

    assert_eq!(deployer.status(&stacks[0]).await.unwrap(), NOT_DEPLOYED);
    assert!(deployer.sync(&stacks).await.is_err());

    cloud.put_stack(REGION, "network", "UPDATE_COMPLETE", Some(PLAIN_TEMPLATE));
    assert_eq!(deployer.status(&stacks[0]).await.unwrap(), "UPDATE_COMPLETE");

    let synced = deployer.sync(&stacks).await.unwrap();
    assert_eq!(
        synced[&stacks[0].id()]["QueueUrl"],
        "https://sqs/queue"
    );
    assert!(outputs.exists());
}
