// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Installs the process-wide emitter, so it keeps to a binary of its own.

use emit::Props;
use nslock::MemoryStore;
use std::sync::{Arc, Mutex};
use txhandler::{Mkdir, TransactionConfig, TransactionHandler};

type Captured = Arc<Mutex<Vec<(String, Option<String>)>>>;

#[tokio::test]
async fn test_events_inside_an_attempt_carry_the_correlation_id() {
    let captured: Captured = Arc::default();
    let sink = captured.clone();
    let rt = emit::setup()
        .emit_to(emit::emitter::from_fn(move |evt| {
            let correlation = evt.props().pull::<String, _>("correlation");
            sink.lock().unwrap().push((evt.msg().to_string(), correlation));
        }))
        .init();

    let config = TransactionConfig {
        server_id: Some(4),
        ..TransactionConfig::default()
    };
    let handler = TransactionHandler::new(Arc::new(MemoryStore::new()), config);
    _ = handler.execute(&mut Mkdir::new("/logs")).await.unwrap();
    drop(rt);

    let events = captured.lock().unwrap().clone();
    let nested: Vec<_> = events
        .iter()
        .filter(|(msg, _)| {
            msg.starts_with("locked ") || msg.starts_with("committing ") || msg.starts_with("mkdir ")
        })
        .collect();
    assert!(nested.iter().any(|(msg, _)| msg.starts_with("locked ")));
    assert!(nested.iter().any(|(msg, _)| msg.starts_with("committing ")));
    assert!(nested.iter().any(|(msg, _)| msg.starts_with("mkdir ")));
    for (msg, correlation) in nested {
        assert_eq!(correlation.as_deref(), Some("NN (4) mkdir"), "{msg}");
    }
}
