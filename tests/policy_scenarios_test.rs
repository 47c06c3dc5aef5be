//! 策略端到端场景：订餐、知识库、嵌套任务、失败不重试

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use worksheets::action::{ActionExecutor, ApiRegistry};
use worksheets::knowledge::StaticKnowledgeBase;
use worksheets::state::{FieldValue, TaskStatus};
use worksheets::template::{load_spec_file, FieldBuilder, FieldType, TemplateRegistry, WorksheetBuilder};
use worksheets::{AgentAct, DialogueState, MergeError, PolicyEngine, PolicySettings, StateDelta};

const IDLE: &str = "Is there anything else I can help you with?";

fn config_file(rel: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(rel)
}

fn restaurant_engine() -> PolicyEngine {
    let registry = load_spec_file(&config_file("config/worksheets/restaurant.toml")).unwrap();
    let kb = StaticKnowledgeBase::from_file(&config_file("config/knowledge.toml")).unwrap();
    PolicyEngine::new(
        Arc::new(registry),
        ActionExecutor::new(ApiRegistry::with_builtins(), 5),
        PolicySettings::default(),
    )
    .with_knowledge(Arc::new(kb))
}

fn ask(task: &str, field: &str, description: &str) -> AgentAct {
    AgentAct::AskField {
        task: task.into(),
        field: field.into(),
        description: description.into(),
    }
}

#[tokio::test]
async fn test_book_restaurant_end_to_end() {
    let engine = restaurant_engine();
    let mut state = DialogueState::new();

    let acts = engine
        .run_turn(
            &mut state,
            StateDelta::new().new_task_with("BookRestaurant", [("restaurant", json!("Nice Place"))]),
        )
        .await
        .unwrap();
    assert_eq!(acts, vec![ask("BookRestaurant", "date", "For which date?")]);

    // date 需要确认，确认请求压过下一个字段问题
    let acts = engine
        .run_turn(&mut state, StateDelta::new().assign("date", json!("Friday")))
        .await
        .unwrap();
    assert_eq!(
        acts,
        vec![AgentAct::AskForFieldConfirmation {
            task: "BookRestaurant".into(),
            field: "date".into(),
            value: FieldValue::String("Friday".into()),
        }]
    );
    assert_eq!(state.focus().unwrap().status, TaskStatus::AwaitingConfirmation);

    let acts = engine
        .run_turn(&mut state, StateDelta::new().confirm("date"))
        .await
        .unwrap();
    assert_eq!(acts, vec![ask("BookRestaurant", "people", "How many people?")]);

    let acts = engine
        .run_turn(&mut state, StateDelta::new().assign("people", json!(2)))
        .await
        .unwrap();
    assert_eq!(acts, vec![AgentAct::report("booking", "confirmed")]);
    assert!(state.focus_stack.is_empty());

    // 再跑一次不会重复执行动作
    let acts = engine.run_policy(&mut state).await;
    assert_eq!(acts, vec![AgentAct::say(IDLE)]);
}

#[tokio::test]
async fn test_rejected_confirmation_asks_again() {
    let engine = restaurant_engine();
    let mut state = DialogueState::new();
    engine
        .run_turn(
            &mut state,
            StateDelta::new()
                .new_task_with("BookRestaurant", [("restaurant", json!("Nice Place"))])
                .assign("date", json!("Friday")),
        )
        .await
        .unwrap();

    let acts = engine
        .run_turn(&mut state, StateDelta::new().reject("date"))
        .await
        .unwrap();
    assert_eq!(acts, vec![ask("BookRestaurant", "date", "For which date?")]);
    assert!(!state.focus().unwrap().is_set("date"));
}

#[tokio::test]
async fn test_pending_confirmation_blocks_action_until_confirmed() {
    let engine = restaurant_engine();
    let mut state = DialogueState::new();

    // 必填字段一次给齐，date 仍待确认：动作不得执行
    let acts = engine
        .run_turn(
            &mut state,
            StateDelta::new()
                .new_task_with("BookRestaurant", [("restaurant", json!("Nice Place"))])
                .assign("date", json!("Friday"))
                .assign("people", json!(2)),
        )
        .await
        .unwrap();
    assert_eq!(
        acts,
        vec![AgentAct::AskForFieldConfirmation {
            task: "BookRestaurant".into(),
            field: "date".into(),
            value: FieldValue::String("Friday".into()),
        }]
    );
    let record = state.focus().unwrap();
    assert_eq!(record.template, "BookRestaurant");
    assert_eq!(record.status, TaskStatus::AwaitingConfirmation);
    assert!(record.actions_executed.is_empty());

    let acts = engine
        .run_turn(&mut state, StateDelta::new().confirm("date"))
        .await
        .unwrap();
    assert_eq!(acts, vec![AgentAct::report("booking", "confirmed")]);
    assert!(state.focus_stack.is_empty());
}

#[tokio::test]
async fn test_invalid_enum_leaves_state_unchanged() {
    let engine = restaurant_engine();
    let mut state = DialogueState::new();
    engine
        .run_turn(
            &mut state,
            StateDelta::new().new_task_with("BookRestaurant", [("restaurant", json!("Nice Place"))]),
        )
        .await
        .unwrap();
    let before = state.clone();

    let err = engine
        .run_turn(
            &mut state,
            StateDelta::new()
                .assign("people", json!(4))
                .assign("cuisine", json!("French")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MergeError::InvalidEnumValue { .. }));
    assert_eq!(state, before);

    // 大小写不敏感，归一化为声明的取值
    engine
        .run_turn(&mut state, StateDelta::new().assign("cuisine", json!("thai")))
        .await
        .unwrap();
    assert_eq!(
        state.focus().unwrap().value("cuisine"),
        Some(&FieldValue::Enum("Thai".into()))
    );
}

#[tokio::test]
async fn test_duplicate_active_task_rejected() {
    let engine = restaurant_engine();
    let mut state = DialogueState::new();
    engine
        .run_turn(&mut state, StateDelta::new().new_task("BookRestaurant"))
        .await
        .unwrap();
    let err = engine
        .run_turn(&mut state, StateDelta::new().new_task("BookRestaurant"))
        .await
        .unwrap_err();
    assert_eq!(err, MergeError::DuplicateActiveTask("BookRestaurant".into()));
    assert_eq!(state.focus_stack.len(), 1);
}

#[tokio::test]
async fn test_knowledge_query_reports_answer() {
    let engine = restaurant_engine();
    let mut state = DialogueState::new();
    let acts = engine
        .run_turn(
            &mut state,
            StateDelta::new().kb_query("Courses", "What is the rating of CS106B?", "rating of CS106B"),
        )
        .await
        .unwrap();
    assert_eq!(
        acts,
        vec![AgentAct::report(
            "What is the rating of CS106B?",
            "CS106B is rated 4.3 on average."
        )]
    );
    assert!(state.kb_records[0].is_finalized());
}

#[tokio::test]
async fn test_knowledge_answer_comes_before_field_question() {
    let engine = restaurant_engine();
    let mut state = DialogueState::new();
    let acts = engine
        .run_turn(
            &mut state,
            StateDelta::new()
                .new_task_with("BookRestaurant", [("restaurant", json!("Nice Place"))])
                .kb_query("Courses", "rating?", "rating of CS229"),
        )
        .await
        .unwrap();
    assert_eq!(
        acts,
        vec![
            AgentAct::report("rating?", "CS229 is rated 4.6 on average."),
            ask("BookRestaurant", "date", "For which date?"),
        ]
    );
}

fn nested_engine(counter: Arc<AtomicUsize>) -> PolicyEngine {
    let mut registry = TemplateRegistry::new();
    registry
        .register(
            WorksheetBuilder::task("PlanTrip")
                .field(FieldBuilder::new("city", FieldType::String))
                .field(FieldBuilder::new("nights", FieldType::Int))
                .action("say('Trip to {city} planned')")
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            WorksheetBuilder::task("CheckWeather")
                .field(FieldBuilder::new("city", FieldType::String))
                .action("forecast = call weather(city)")
                .field(FieldBuilder::new("forecast", FieldType::String).internal().optional())
                .action("report(city, forecast)")
                .build()
                .unwrap(),
        )
        .unwrap();
    let mut apis = ApiRegistry::with_builtins();
    apis.register_fn("weather", move |args| {
        counter.fetch_add(1, Ordering::SeqCst);
        match args.get("city").and_then(|v| v.as_str()) {
            Some("Atlantis") => Err("unknown city".to_string()),
            Some(city) => Ok(json!(format!("sunny in {city}"))),
            None => Err("missing city".to_string()),
        }
    });
    PolicyEngine::new(
        Arc::new(registry),
        ActionExecutor::new(apis, 5),
        PolicySettings::default(),
    )
}

#[tokio::test]
async fn test_nested_task_pop_restores_focus() {
    let engine = nested_engine(Arc::new(AtomicUsize::new(0)));
    let mut state = DialogueState::new();

    let acts = engine
        .run_turn(
            &mut state,
            StateDelta::new().new_task_with("PlanTrip", [("city", json!("Paris"))]),
        )
        .await
        .unwrap();
    assert_eq!(acts, vec![ask("PlanTrip", "nights", "")]);
    let outer_id = state.focus().unwrap().id.clone();
    let stack_before = state.focus_stack.clone();

    // 中途插入天气查询：完成后出栈，焦点回到原任务
    let acts = engine
        .run_turn(
            &mut state,
            StateDelta::new().new_task_with("CheckWeather", [("city", json!("Paris"))]),
        )
        .await
        .unwrap();
    assert_eq!(
        acts,
        vec![
            AgentAct::report("Paris", "sunny in Paris"),
            ask("PlanTrip", "nights", ""),
        ]
    );
    assert_eq!(state.focus().unwrap().id, outer_id);
    assert_eq!(state.focus_stack, stack_before);

    let acts = engine
        .run_turn(&mut state, StateDelta::new().assign("nights", json!(3)))
        .await
        .unwrap();
    assert_eq!(acts, vec![AgentAct::say("Trip to Paris planned")]);
    assert!(state.focus_stack.is_empty());
}

#[tokio::test]
async fn test_failed_action_not_retried_without_delta() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = nested_engine(calls.clone());
    let mut state = DialogueState::new();

    let acts = engine
        .run_turn(
            &mut state,
            StateDelta::new().new_task_with("CheckWeather", [("city", json!("Atlantis"))]),
        )
        .await
        .unwrap();
    assert_eq!(acts, vec![AgentAct::report("weather", "failed: unknown city")]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.focus().unwrap().status, TaskStatus::InProgress);

    engine.run_policy(&mut state).await;
    engine.run_policy(&mut state).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // 修正输入并显式重试后成功
    let acts = engine
        .run_turn(
            &mut state,
            StateDelta::new()
                .assign("city", json!("Rome"))
                .retry_task("CheckWeather"),
        )
        .await
        .unwrap();
    assert_eq!(acts, vec![AgentAct::report("Rome", "sunny in Rome")]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(state.focus_stack.is_empty());
}

#[tokio::test]
async fn test_retry_setting_retries_on_next_turn() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = TemplateRegistry::new();
    registry
        .register(
            WorksheetBuilder::task("Ping")
                .field(FieldBuilder::new("host", FieldType::String))
                .action("call ping(host)")
                .build()
                .unwrap(),
        )
        .unwrap();
    let mut apis = ApiRegistry::new();
    let counter = calls.clone();
    apis.register_fn("ping", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err("unreachable".to_string())
    });
    let settings = PolicySettings {
        retry_failed_actions: true,
        ..PolicySettings::default()
    };
    let engine = PolicyEngine::new(Arc::new(registry), ActionExecutor::new(apis, 5), settings);
    let mut state = DialogueState::new();

    engine
        .run_turn(&mut state, StateDelta::new().new_task_with("Ping", [("host", json!("db"))]))
        .await
        .unwrap();
    // 同一轮内只尝试一次
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    engine.run_policy(&mut state).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
