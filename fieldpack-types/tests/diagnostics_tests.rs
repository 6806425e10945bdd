use fieldpack_types::{CancelToken, Diagnostics, LayerId, Severity};

#[test]
fn diagnostics_keep_emission_order() {
    let roads = LayerId::new("roads");
    let mut d = Diagnostics::new();
    d.warning(&roads, "first");
    d.info(&roads, "second");
    let reasons: Vec<_> = d.iter().map(|e| e.reason.as_str()).collect();
    assert_eq!(reasons, vec!["first", "second"]);
}

#[test]
fn diagnostics_filter_by_layer() {
    let roads = LayerId::new("roads");
    let trees = LayerId::new("trees");
    let mut d = Diagnostics::new();
    d.warning(&roads, "unreachable");
    d.error(&trees, "broken");
    assert_eq!(d.for_layer(&roads).count(), 1);
    assert!(d.has_severity(Severity::Error));
    assert_eq!(d.len(), 2);
}

#[test]
fn diagnostic_display_names_layer() {
    let mut d = Diagnostics::new();
    d.warning(&LayerId::new("roads"), "source unavailable");
    let line = d.iter().next().unwrap().to_string();
    assert_eq!(line, "[warning] roads: source unavailable");
}

#[test]
fn cancel_token_is_shared_between_clones() {
    let token = CancelToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());
    token.cancel();
    assert!(clone.is_cancelled());
}
