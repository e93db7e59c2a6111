//! End-to-end exchanges through the data tracing filter

use datatrace_core::headers::{DATA, DATA_OVERRIDE, REQUEST_ID};
use datatrace_core::{
    ConcurrentStore, CorrelationStore, LockedStore, Operation, Phase, Policy, PolicyAction,
    PolicyError, PolicyEvaluator, NO_DATA,
};
use datatrace_correlate::{DataTracingFilter, ExchangeContext, ExchangeReplay, FilterStatus};
use http::header::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;

fn stores() -> Vec<(&'static str, Arc<dyn CorrelationStore>)> {
    vec![
        ("concurrent", Arc::new(ConcurrentStore::new())),
        ("locked", Arc::new(LockedStore::new())),
    ]
}

fn filter_with(store: Arc<dyn CorrelationStore>, actions: Vec<PolicyAction>) -> DataTracingFilter {
    DataTracingFilter::new(PolicyEvaluator::new(Policy::new(actions)), store)
}

fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn scenario_a_first_request_adds_label() {
    for (name, store) in stores() {
        let filter = filter_with(
            Arc::clone(&store),
            vec![PolicyAction::new(Phase::Inbound, Operation::Add, "pii")],
        );
        let mut ctx = ExchangeContext::new(1);
        let mut req = headers(&[(REQUEST_ID, "r1")]);

        assert!(filter.on_request(&mut ctx, &mut req).is_continue(), "{name}");
        assert_eq!(req.get(DATA).map(String::as_str), Some("pii"), "{name}");
        assert_eq!(store.get("DATA-r1").as_deref(), Some("pii"), "{name}");
    }
}

#[test]
fn scenario_b_check_exclude_rejects_before_rewrite() {
    for (name, store) in stores() {
        let filter = filter_with(
            store,
            vec![PolicyAction::new(
                Phase::Inbound,
                Operation::CheckExclude,
                "blocked",
            )],
        );
        let mut ctx = ExchangeContext::new(1);
        let mut req = headers(&[(REQUEST_ID, "r2"), (DATA, "blocked;ok")]);

        let status = filter.on_request(&mut ctx, &mut req);
        assert_eq!(
            status,
            FilterStatus::Reset(PolicyError::Rejected {
                operation: Operation::CheckExclude,
                member: "blocked".to_string(),
            }),
            "{name}"
        );
        assert_eq!(req.get(DATA).map(String::as_str), Some("blocked;ok"), "{name}");
    }
}

#[test]
fn scenario_c_override_applied_and_stripped() {
    for (name, store) in stores() {
        let filter = filter_with(store, vec![]);
        let mut ctx = ExchangeContext::new(1);
        let mut req = headers(&[
            (REQUEST_ID, "rc"),
            (DATA, "base"),
            (DATA_OVERRIDE, "ADD(extra)"),
        ]);

        assert!(filter.on_request(&mut ctx, &mut req).is_continue(), "{name}");
        assert_eq!(req.get(DATA).map(String::as_str), Some("base;extra"), "{name}");
        assert!(!req.contains_key(DATA_OVERRIDE), "{name}");
    }
}

#[test]
fn scenario_d_trace_lifecycle() {
    for (name, store) in stores() {
        let filter = filter_with(
            Arc::clone(&store),
            vec![
                PolicyAction::new(Phase::Inbound, Operation::Add, "in"),
                PolicyAction::new(Phase::Outbound, Operation::Add, "out"),
            ],
        );

        let mut parent = ExchangeContext::new(1);
        let mut req = headers(&[(REQUEST_ID, "r3")]);
        assert!(filter.on_request(&mut parent, &mut req).is_continue());
        assert_eq!(req.get(DATA).map(String::as_str), Some("in"), "{name}");

        // Same id from another connection: DATA- already exists, OUTBOUND.
        let mut child = ExchangeContext::new(2);
        let mut child_req = headers(&[(REQUEST_ID, "r3")]);
        assert!(filter.on_request(&mut child, &mut child_req).is_continue());
        assert_eq!(child_req.get(DATA).map(String::as_str), Some("in;out"), "{name}");

        let mut resp = HashMap::new();
        assert!(filter.on_response(&parent, &mut resp).is_continue());
        assert_eq!(store.get("PARENT-r3"), None, "{name}");
        assert_eq!(store.get("DATA-r3"), None, "{name}");

        // A later request reusing the id is a fresh parent.
        let mut again = ExchangeContext::new(3);
        let mut again_req = headers(&[(REQUEST_ID, "r3")]);
        assert!(filter.on_request(&mut again, &mut again_req).is_continue());
        assert_eq!(again_req.get(DATA).map(String::as_str), Some("in"), "{name}");
        assert_eq!(store.get("PARENT-r3").as_deref(), Some("3"), "{name}");
        assert_eq!(filter.metrics().snapshot().traces_opened, 2, "{name}");
    }
}

#[test]
fn forwarded_payload_is_normalized() {
    let filter = filter_with(Arc::new(ConcurrentStore::new()), vec![]);

    let mut ctx = ExchangeContext::new(1);
    let mut req = headers(&[(REQUEST_ID, "n"), (DATA, "b;a;;b;__NONE__")]);
    assert!(filter.on_request(&mut ctx, &mut req).is_continue());
    let first = req.get(DATA).cloned().unwrap_or_default();
    assert_eq!(first, "a;b");

    // Feeding the output back in yields the same payload.
    let mut resp = headers(&[(DATA, first.as_str())]);
    assert!(filter.on_response(&ctx, &mut resp).is_continue());
    assert_eq!(resp.get(DATA), Some(&first));
}

#[test]
fn empty_payload_serializes_as_sentinel() {
    let filter = filter_with(Arc::new(ConcurrentStore::new()), vec![]);
    let mut ctx = ExchangeContext::new(1);
    let mut req = headers(&[(REQUEST_ID, "e"), (DATA, ";;")]);

    assert!(filter.on_request(&mut ctx, &mut req).is_continue());
    assert_eq!(req.get(DATA).map(String::as_str), Some(NO_DATA));
}

#[test]
fn concurrent_requests_elect_one_parent() {
    const THREADS: u64 = 16;

    for (name, store) in stores() {
        let filter = Arc::new(filter_with(Arc::clone(&store), vec![]));
        let barrier = Arc::new(Barrier::new(THREADS as usize));

        let handles: Vec<_> = (0..THREADS)
            .map(|conn| {
                let filter = Arc::clone(&filter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut ctx = ExchangeContext::new(conn);
                    let mut req = headers(&[(REQUEST_ID, "race")]);
                    barrier.wait();
                    filter.on_request(&mut ctx, &mut req).is_continue()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap(), "{name}");
        }

        let snapshot = filter.metrics().snapshot();
        assert_eq!(snapshot.traces_opened, 1, "{name}");
        assert_eq!(snapshot.child_requests, THREADS - 1, "{name}");

        let owner: u64 = store.get("PARENT-race").unwrap().parse().unwrap();
        assert!(owner < THREADS, "{name}");
        assert_eq!(store.len(), 2, "{name}");
    }
}

#[test]
fn http_header_map_exchange() {
    let filter = filter_with(
        Arc::new(ConcurrentStore::new()),
        vec![PolicyAction::new(Phase::Outbound, Operation::Remove, "internal")],
    );

    let mut ctx = ExchangeContext::new(9);
    let mut req = HeaderMap::new();
    req.insert(REQUEST_ID, HeaderValue::from_static("h1"));
    req.insert(DATA, HeaderValue::from_static("internal;public"));
    req.insert(DATA_OVERRIDE, HeaderValue::from_static("ADD(tagged)"));

    assert!(filter.on_request(&mut ctx, &mut req).is_continue());
    assert!(req.get(DATA_OVERRIDE).is_none());
    assert_eq!(req.get(DATA).unwrap(), "internal;public;tagged");

    let mut resp = HeaderMap::new();
    assert!(filter.on_response(&ctx, &mut resp).is_continue());
    assert_eq!(resp.get(DATA).unwrap(), "public;tagged");
    assert!(filter.store().is_empty());
}

#[tokio::test]
async fn replay_script_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exchanges.jsonl");
    std::fs::write(
        &path,
        concat!(
            "# parent with one child\n",
            "{\"event\":\"request\",\"stream\":1,\"connection\":1,\"headers\":{\"x-request-id\":\"t\",\"x-data\":\"a\"}}\n",
            "{\"event\":\"request\",\"stream\":2,\"connection\":2,\"headers\":{\"x-request-id\":\"t\"}}\n",
            "\n",
            "{\"event\":\"response\",\"stream\":2,\"headers\":{\"x-data\":\"b\"}}\n",
            "{\"event\":\"response\",\"stream\":1,\"headers\":{}}\n",
            "{\"event\":\"request\",\"stream\":3,\"connection\":3,\"headers\":{\"x-data\":\"untraced\"}}\n",
        ),
    )
    .unwrap();

    let store: Arc<dyn CorrelationStore> = Arc::new(LockedStore::new());
    let filter = Arc::new(filter_with(
        Arc::clone(&store),
        vec![PolicyAction::new(Phase::Inbound, Operation::Add, "seen")],
    ));
    let mut replay = ExchangeReplay::new(Arc::clone(&filter));
    let outcomes = replay.run_file(&path).await.unwrap();

    let data: Vec<Option<&str>> = outcomes
        .iter()
        .map(|o| o.headers.get(DATA).map(String::as_str))
        .collect();
    assert_eq!(
        data,
        vec![
            Some("a;seen"),
            Some("a;seen"),
            Some("b;seen"),
            Some("b;seen"),
            Some("untraced"),
        ]
    );
    assert_eq!(outcomes[4].line, 7);
    assert_eq!(outcomes[4].trace_id, None);
    assert!(store.is_empty());
    assert_eq!(replay.open_streams(), 1);
}
