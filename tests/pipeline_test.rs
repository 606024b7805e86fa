mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use talk2sql::config::SessionConfig;
use talk2sql::database::ExecutionOutcome;
use talk2sql::history::TurnRole;
use talk2sql::llm::Role;
use talk2sql::PipelineError;

#[tokio::test]
async fn test_france_credit_limit_end_to_end() {
    let harness = Harness::new(
        ScriptedLlm::france(),
        FakeDatabase::with_result(FRANCE_SQL, Ok(france_rows())),
    )
    .await;

    let reply = harness.service.ask(None, FRANCE_QUESTION).await.unwrap();

    assert_eq!(reply.answer, "Three customers in France have a credit limit above 20000.");
    assert!(reply.trace.tables.contains("customers"));
    assert_eq!(reply.trace.examples.len(), 2);
    assert_eq!(
        reply.trace.examples[0].query,
        "SELECT * FROM customers WHERE country = 'France' AND creditLimit > 20000;"
    );
    assert_eq!(one_line(&reply.trace.sql), FRANCE_SQL);
    assert!(!reply.trace.degraded);
    assert!(matches!(reply.trace.outcome, ExecutionOutcome::Rows(ref rows) if rows.row_count() == 3));

    // the sanitized statement is what reaches the database
    let executed = harness.db.executed();
    assert_eq!(executed.len(), 1);
    assert!(!executed[0].contains("```"));
    assert_eq!(harness.db.described.lock().unwrap().clone(), vec!["customers".to_string()]);

    let rephrase = harness.llm.rephrase_prompts.lock().unwrap().clone();
    assert_eq!(rephrase.len(), 1);
    assert!(rephrase[0].contains(&format!("Question: {}", FRANCE_QUESTION)));
    assert!(rephrase[0].contains("Atelier graphique"));
}

#[tokio::test]
async fn test_generation_prompt_carries_table_info_and_examples() {
    let harness = Harness::new(ScriptedLlm::france(), FakeDatabase::default()).await;
    harness.service.ask(None, FRANCE_QUESTION).await.unwrap();

    let prompts = harness.llm.generation_prompts.lock().unwrap().clone();
    let prompt = &prompts[0];
    assert_eq!(prompt[0].role, Role::System);
    assert!(prompt[0].content.contains("MySQL expert"));
    assert!(prompt[0].content.contains("-- customers: Customer records"));
    assert!(prompt[0].content.contains("CREATE TABLE customers"));
    // system, two examples, question
    assert_eq!(prompt.len(), 1 + 4 + 1);
    assert!(prompt[1].content.ends_with("\nSQLQuery:"));
    assert_eq!(prompt[2].role, Role::Assistant);
    assert_eq!(
        prompt.last().unwrap().content,
        format!("{}\nSQLQuery: ", FRANCE_QUESTION)
    );
}

#[tokio::test]
async fn test_history_grows_by_two_per_turn() {
    let harness = Harness::new(ScriptedLlm::france(), FakeDatabase::default()).await;
    let questions = [
        "How many customers are in France?",
        "And in Germany?",
        "Which of them has the highest credit limit?",
    ];

    let mut session_id = None;
    for question in questions {
        let reply = harness
            .service
            .ask(session_id.as_deref(), question)
            .await
            .unwrap();
        session_id = Some(reply.session_id);
    }
    let session_id = session_id.unwrap();

    let turns = harness.service.history(&session_id).await.unwrap();
    assert_eq!(turns.len(), 2 * questions.len());
    for (i, question) in questions.iter().enumerate() {
        assert_eq!(turns[2 * i].role, TurnRole::User);
        assert_eq!(turns[2 * i].content, *question);
        assert_eq!(turns[2 * i + 1].role, TurnRole::Assistant);
    }

    // the third generation prompt replays the two earlier turns verbatim
    let prompts = harness.llm.generation_prompts.lock().unwrap().clone();
    let third = &prompts[2];
    let replayed: Vec<&str> = third[5..third.len() - 1]
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(replayed.len(), 4);
    assert_eq!(replayed[0], questions[0]);
    assert_eq!(replayed[2], questions[1]);
}

#[tokio::test]
async fn test_execution_error_is_explained_not_raised() {
    let llm = ScriptedLlm::new(
        json!({"name": ["orders"]}),
        "SQLQuery: SELECT * FROM invoices;",
        "The invoices table does not exist, so I cannot answer that.",
    );
    let db = FakeDatabase::with_result(
        "SELECT * FROM invoices;",
        Err("Table 'crm.invoices' doesn't exist".to_string()),
    );
    let harness = Harness::new(llm, db).await;

    let reply = harness.service.ask(None, "List all invoices").await.unwrap();

    assert!(reply.answer.contains("does not exist"));
    assert!(reply.trace.outcome.is_failure());
    let rephrase = harness.llm.rephrase_prompts.lock().unwrap().clone();
    assert!(rephrase[0].contains("SQL Result: Error: Table 'crm.invoices' doesn't exist"));
    assert_eq!(harness.service.history(&reply.session_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_empty_question_is_rejected_before_any_call() {
    let harness = Harness::new(ScriptedLlm::france(), FakeDatabase::default()).await;
    let embeds_after_startup = harness.embed_calls();

    for question in ["", "   \n"] {
        let err = harness.service.ask(None, question).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
    }

    assert_eq!(harness.llm.total_calls(), 0);
    assert_eq!(harness.embed_calls(), embeds_after_startup);
    assert!(harness.db.executed().is_empty());
}

#[tokio::test]
async fn test_unknown_table_aborts_the_turn() {
    let llm = ScriptedLlm::new(json!({"name": ["customers", "invoices"]}), "SELECT 1;", "x");
    let harness = Harness::new(llm, FakeDatabase::default()).await;

    let err = harness.service.ask(None, "Show invoices per customer").await.unwrap_err();
    assert!(matches!(err, PipelineError::MalformedModelOutput(_)));
    assert!(err.to_string().contains("invoices"));
    assert!(harness.db.executed().is_empty());
    assert!(harness.llm.generation_prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rephrase_failure_is_fatal() {
    let mut llm = ScriptedLlm::france();
    llm.answer = Err("service unavailable".to_string());
    let harness = Harness::new(llm, FakeDatabase::default()).await;

    let err = harness.service.ask(None, FRANCE_QUESTION).await.unwrap_err();
    assert!(matches!(err, PipelineError::RephraseFailure(_)));
    assert!(err.to_string().contains("service unavailable"));
    // the query still ran before the rephraser failed
    assert_eq!(harness.db.executed().len(), 1);
}

#[tokio::test]
async fn test_slow_model_times_out() {
    let mut llm = ScriptedLlm::france();
    llm.delay = Some(Duration::from_millis(500));
    let harness = Harness::with_timeout(llm, FakeDatabase::default(), Duration::from_millis(50)).await;

    let result = harness.service.ask(None, FRANCE_QUESTION).await;
    assert!(matches!(result, Err(PipelineError::Timeout(_))));
}

#[tokio::test]
async fn test_sessions_do_not_share_history() {
    let harness = Harness::new(ScriptedLlm::france(), FakeDatabase::default()).await;
    let a = harness.service.ask(None, "How many customers?").await.unwrap();
    let b = harness.service.ask(None, "How many orders?").await.unwrap();
    assert_ne!(a.session_id, b.session_id);

    harness
        .service
        .ask(Some(&a.session_id), "And in France?")
        .await
        .unwrap();

    assert_eq!(harness.service.history(&a.session_id).await.unwrap().len(), 4);
    assert_eq!(harness.service.history(&b.session_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrent_turns_in_one_session_are_serialized() {
    let harness = Harness::new(ScriptedLlm::france(), FakeDatabase::default()).await;
    let first = harness.service.ask(None, "q0").await.unwrap();
    let id = first.session_id.as_str();

    let (a, b) = tokio::join!(
        harness.service.ask(Some(id), "q1"),
        harness.service.ask(Some(id), "q2"),
    );
    a.unwrap();
    b.unwrap();

    let turns = harness.service.history(id).await.unwrap();
    assert_eq!(turns.len(), 6);
    // each question is immediately followed by its own answer
    for pair in turns.chunks(2) {
        assert_eq!(pair[0].role, TurnRole::User);
        assert_eq!(pair[1].role, TurnRole::Assistant);
    }
}

#[tokio::test]
async fn test_session_with_turn_in_flight_is_not_evicted() {
    let mut llm = ScriptedLlm::france();
    llm.delay = Some(Duration::from_millis(100));
    let sessions = SessionConfig {
        ttl_secs: 60,
        max_sessions: 1,
    };
    let harness = Harness::build(llm, FakeDatabase::default(), Duration::from_secs(10), sessions).await;

    let (slow, other) = tokio::join!(harness.service.ask(None, FRANCE_QUESTION), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.service.ask(None, "How many orders are there?").await
    });
    let slow = slow.unwrap();
    let other = other.unwrap();

    // the first session was busy when the second one needed room
    assert_eq!(harness.service.history(&slow.session_id).await.unwrap().len(), 2);
    assert_eq!(harness.service.history(&other.session_id).await.unwrap().len(), 2);
}
