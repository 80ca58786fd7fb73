//! Fuzz target for vector clock parsing.
//!
//! This tests that `VectorClock::from_json` sanitizes arbitrary JSON
//! without panicking and that comparison of the results never panics.

#![no_main]

use libfuzzer_sys::fuzz_target;
use meshkv::clock::{ClockOrdering, VectorClock};

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let clock_a = match serde_json::from_str::<serde_json::Value>(a) {
        Ok(v) => VectorClock::from_json(&v),
        Err(_) => VectorClock::new(),
    };
    let clock_b = match serde_json::from_str::<serde_json::Value>(b) {
        Ok(v) => VectorClock::from_json(&v),
        Err(_) => VectorClock::new(),
    };

    // Should never panic
    let ab = clock_a.compare(&clock_b);
    let ba = clock_b.compare(&clock_a);

    // Antisymmetry
    match ab {
        ClockOrdering::Before => assert_eq!(ba, ClockOrdering::After),
        ClockOrdering::After => assert_eq!(ba, ClockOrdering::Before),
        other => assert_eq!(ba, other),
    }

    // Merge dominates both inputs
    let mut merged = clock_a.clone();
    merged.merge(&clock_b);
    assert_ne!(merged.compare(&clock_a), ClockOrdering::Before);
    assert_ne!(merged.compare(&clock_b), ClockOrdering::Before);
});
