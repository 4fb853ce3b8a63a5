//! History compression lifecycle tests driven through the gateway

mod common;

use std::sync::Arc;

use mechanic_gateway::db::ConversationRepo;
use mechanic_gateway::{
    ChatGateway, CompressedSummary, Error, GatewayConfig, TurnOutcome, TurnRequest,
};

use common::{ScriptedService, init_tracing, setup_test_db};

fn compressing_gateway(
    threshold: usize,
) -> (ChatGateway, Arc<ScriptedService>, ConversationRepo) {
    init_tracing();
    let mut config = GatewayConfig::default();
    config.compression.threshold = threshold;
    let pool = setup_test_db();
    let repo = ConversationRepo::new(pool.clone());
    let service = Arc::new(ScriptedService::default());
    let gateway = ChatGateway::new(config, pool, service.clone());
    (gateway, service, repo)
}

async fn drive_turn(gateway: &ChatGateway, conversation: Option<&str>, message: &str) -> String {
    let outcome = gateway
        .handle_turn(TurnRequest {
            user_id: "driver-1".to_string(),
            conversation_id: conversation.map(str::to_string),
            message: message.to_string(),
            language: None,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::Reply(_)));
    outcome.conversation_id().to_string()
}

#[tokio::test]
async fn threshold_compression_cycles_with_watermarks() {
    let (gateway, service, repo) = compressing_gateway(4);

    let id = drive_turn(&gateway, None, "My 2018 Toyota Camry shows code P0301").await;
    for i in 1..9 {
        drive_turn(
            &gateway,
            Some(id.as_str()),
            &format!("more detail {i}: it still misfires"),
        )
        .await;
    }

    // Nine replies plus one summarization call per compression
    assert_eq!(service.calls("generate"), 11);

    let active = repo.get_active_context(&id).unwrap().expect("active context");
    assert_eq!(active.version, 2);
    assert_eq!(active.watermark, 8);

    let history = repo.context_history(&id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].version, 1);
    assert_eq!(history[0].watermark, 4);
    assert!(!history[0].active);
    assert!(history[1].active);

    // Salient facts survive into the stored summary
    let summary: CompressedSummary = serde_json::from_str(&active.content).unwrap();
    assert!(summary.codes.contains(&"P0301".to_string()));
    assert_eq!(summary.vehicle.make.as_deref(), Some("Toyota"));
}

#[tokio::test]
async fn token_budget_compresses_before_the_turn_threshold() {
    init_tracing();
    let mut config = GatewayConfig::default();
    config.compression.threshold = 50;
    config.compression.token_budget = 30;
    let pool = setup_test_db();
    let repo = ConversationRepo::new(pool.clone());
    let service = Arc::new(ScriptedService::default());
    let gateway = ChatGateway::new(config, pool, service.clone());

    let id = drive_turn(
        &gateway,
        None,
        "The brakes grind loudly, the pedal pulses under my foot, and the car pulls \
         hard to the right every time I slow down from highway speed.",
    )
    .await;

    let active = repo.get_active_context(&id).unwrap().expect("active context");
    assert_eq!(active.version, 1);
    assert_eq!(active.watermark, 1);
}

#[tokio::test]
async fn failed_compression_defers_to_the_next_turn() {
    let (gateway, service, repo) = compressing_gateway(4);

    let id = drive_turn(&gateway, None, "my 2018 Camry misfires, code P0301").await;
    for i in 1..3 {
        drive_turn(&gateway, Some(id.as_str()), &format!("more detail {i}")).await;
    }

    // Turn four: the reply succeeds, the summarization call does not
    {
        let mut queue = service.generation.lock().unwrap();
        queue.push_back(Ok("A fresh reply.".to_string()));
        queue.push_back(Err(Error::Provider("summarizer down".into())));
    }
    drive_turn(&gateway, Some(id.as_str()), "turn four detail").await;
    assert!(repo.get_active_context(&id).unwrap().is_none());

    // The next turn retries and catches up
    drive_turn(&gateway, Some(id.as_str()), "turn five detail").await;
    let active = repo.get_active_context(&id).unwrap().expect("active context");
    assert_eq!(active.version, 1);
    assert_eq!(active.watermark, 5);
    assert_eq!(service.calls("generate"), 7);
}

#[tokio::test]
async fn a_fresh_gateway_seeds_context_from_the_active_summary() {
    init_tracing();
    let mut config = GatewayConfig::default();
    config.compression.threshold = 2;
    let pool = setup_test_db();
    let repo = ConversationRepo::new(pool.clone());
    let service = Arc::new(ScriptedService::default());
    let gateway = ChatGateway::new(config.clone(), pool.clone(), service);

    let id = drive_turn(&gateway, None, "My 2018 Toyota Camry shows code P0301").await;
    drive_turn(&gateway, Some(id.as_str()), "it happens mostly uphill").await;
    assert!(repo.get_active_context(&id).unwrap().is_some());

    // A separate instance over the same database starts with cold caches
    let fresh = ChatGateway::new(config, pool, Arc::new(ScriptedService::default()));
    let outcome = fresh
        .handle_turn(TurnRequest {
            user_id: "driver-1".to_string(),
            conversation_id: Some(id),
            message: "should I keep driving it?".to_string(),
            language: None,
        })
        .await
        .unwrap();

    let TurnOutcome::Reply(reply) = outcome else {
        panic!("expected a reply, got {outcome:?}");
    };
    assert_eq!(reply.context.vehicle.make.as_deref(), Some("Toyota"));
    assert!(reply.context.codes.contains(&"P0301".to_string()));
}
