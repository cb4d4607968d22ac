//! Property-based invariant tests for status propagation and async
//! sequencing.
//!
//! Random interleavings of writes, enable/disable, clock advances, ticks,
//! out-of-order async answers, resets and submits are applied to a small
//! form. After every step:
//!
//! 1. A disabled node reports `DISABLED` and no errors.
//! 2. A `VALID` node has no errors.
//! 3. An `INVALID` control has at least one error.
//! 4. The root is `PENDING` whenever an enabled child is `PENDING`.
//! 5. Otherwise the root is `INVALID` whenever an enabled child is `INVALID`.
//! 6. Settlement listeners fire exactly once per observed exit from `PENDING`.
//!
//! After the sequence, closing every window and answering every request
//! always reaches a state with nothing pending (7).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use reform_core::validation::{
    DeferredCheck, InfrastructureError, MinLength, Required, ValidationError, ValidationResult,
};
use reform_runtime::{
    ConditionalRule, ControlSchema, ControlStatus, FormEngine, GroupSchema, ManualClock,
    min_age_gate,
};
use serde_json::json;

const CHILDREN: [&str; 3] = ["name", "birthYear", "passport"];

// ── Strategies ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Answer {
    Valid,
    Taken,
    Broken,
}

#[derive(Debug, Clone)]
enum Op {
    SetName(&'static str),
    SetBirthYear(i64),
    Disable(usize),
    Enable(usize),
    Advance(u64),
    Tick,
    /// Answer parked requests, newest first when `reverse`.
    Answer { answer: Answer, reverse: bool },
    Reset,
    Submit,
}

fn answer_strategy() -> impl Strategy<Value = Answer> {
    prop_oneof![Just(Answer::Valid), Just(Answer::Taken), Just(Answer::Broken)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => prop::sample::select(vec!["", "a", "ab", "hadi", "ma9net", "  "]).prop_map(Op::SetName),
        2 => (1990i64..=2020).prop_map(Op::SetBirthYear),
        1 => (0usize..CHILDREN.len()).prop_map(Op::Disable),
        1 => (0usize..CHILDREN.len()).prop_map(Op::Enable),
        3 => (0u64..=250).prop_map(Op::Advance),
        3 => Just(Op::Tick),
        3 => (answer_strategy(), any::<bool>())
            .prop_map(|(answer, reverse)| Op::Answer { answer, reverse }),
        1 => Just(Op::Reset),
        1 => Just(Op::Submit),
    ]
}

// ── Fixture ───────────────────────────────────────────────────────────────

struct Fixture {
    form: FormEngine,
    clock: ManualClock,
    check: DeferredCheck,
    settled: Arc<AtomicUsize>,
}

fn fixture() -> Fixture {
    let clock = ManualClock::new();
    let check = DeferredCheck::new("uniqueName");
    let schema = GroupSchema::new()
        .child(
            "name",
            ControlSchema::new(json!("hadi"))
                .validator(Required::new())
                .validator(MinLength::new(2))
                .async_validator_debounced(check.clone(), Duration::from_millis(100)),
        )
        .child("birthYear", ControlSchema::new(json!(2000)))
        .child("passport", ControlSchema::new(json!("")));
    let mut form = FormEngine::builder(schema)
        .clock(clock.clone())
        .rule(ConditionalRule::new(
            "birthYear",
            min_age_gate(18, 2026),
            "passport",
            Required::new(),
        ))
        .build()
        .unwrap();

    let settled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&settled);
    form.subscribe_settled(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    Fixture {
        form,
        clock,
        check,
        settled,
    }
}

fn answer_all(check: &DeferredCheck, answer: &Answer, reverse: bool) {
    let mut requests = check.take_requests();
    if reverse {
        requests.reverse();
    }
    for request in requests {
        let outcome = match answer {
            Answer::Valid => Ok(ValidationResult::Valid),
            Answer::Taken => Ok(ValidationResult::Invalid(ValidationError::new(
                "uniqueName",
                "taken",
            ))),
            Answer::Broken => Err(InfrastructureError::new("unreachable")),
        };
        request.resolve(outcome);
    }
}

fn apply(fx: &mut Fixture, op: &Op) {
    match op {
        Op::SetName(name) => fx.form.set_value("name", *name).unwrap(),
        Op::SetBirthYear(year) => fx.form.set_value("birthYear", *year).unwrap(),
        Op::Disable(i) => fx.form.disable(CHILDREN[*i]).unwrap(),
        Op::Enable(i) => fx.form.enable(CHILDREN[*i]).unwrap(),
        Op::Advance(ms) => fx.clock.advance(Duration::from_millis(*ms)),
        Op::Tick => {
            fx.form.tick();
        }
        Op::Answer { answer, reverse } => answer_all(&fx.check, answer, *reverse),
        Op::Reset => fx.form.reset(),
        Op::Submit => {
            fx.form.submit();
        }
    }
}

fn check_invariants(form: &FormEngine) -> Result<(), TestCaseError> {
    let mut any_pending = false;
    let mut any_invalid = false;
    for child in CHILDREN {
        let state = form.state(child).unwrap();
        match state.status {
            ControlStatus::Disabled => {
                prop_assert!(state.errors.is_empty(), "{child}: disabled with errors");
            }
            ControlStatus::Valid => {
                prop_assert!(state.errors.is_empty(), "{child}: valid with errors");
            }
            ControlStatus::Invalid => {
                prop_assert!(!state.errors.is_empty(), "{child}: invalid without errors");
                any_invalid = true;
            }
            ControlStatus::Pending => any_pending = true,
        }
    }

    let root = form.root_status();
    if any_pending {
        prop_assert_eq!(root, ControlStatus::Pending);
    } else if any_invalid {
        prop_assert_eq!(root, ControlStatus::Invalid);
    } else {
        prop_assert_eq!(root, ControlStatus::Valid);
    }
    Ok(())
}

// ── Properties ────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn status_invariants_hold_after_every_step(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mut fx = fixture();
        let mut exits = 0usize;
        let mut previous = fx.form.root_status();
        check_invariants(&fx.form)?;

        for op in &ops {
            apply(&mut fx, op);
            check_invariants(&fx.form)?;
            let current = fx.form.root_status();
            if previous == ControlStatus::Pending && current != ControlStatus::Pending {
                exits += 1;
            }
            previous = current;
        }
        prop_assert_eq!(fx.settled.load(Ordering::SeqCst), exits);
    }

    #[test]
    fn draining_always_reaches_quiescence(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mut fx = fixture();
        for op in &ops {
            apply(&mut fx, op);
        }
        for child in CHILDREN {
            fx.form.enable(child).unwrap();
        }
        for _ in 0..4 {
            fx.clock.advance(Duration::from_secs(1));
            fx.form.tick();
            answer_all(&fx.check, &Answer::Valid, false);
            fx.form.tick();
        }
        prop_assert!(fx.form.is_idle());
        prop_assert_eq!(fx.check.pending(), 0);
        for child in CHILDREN {
            prop_assert_ne!(fx.form.status(child).unwrap(), ControlStatus::Pending);
        }
        prop_assert_ne!(fx.form.root_status(), ControlStatus::Pending);
    }
}
