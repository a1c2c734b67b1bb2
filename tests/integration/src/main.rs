//! Integration test harness
//!
//! Runs every test category and prints a summary.
//!
//! ```text
//! cargo run -p integration-tests
//! cargo test -p integration-tests --test ndr_tests
//! cargo test -p integration-tests --test fragmentation_tests
//! cargo test -p integration-tests --test multiplex_tests
//! cargo test -p integration-tests --test security_tests
//! cargo test -p integration-tests --test endtoend_tests
//! ```

use std::process::Command;
use std::time::Instant;

struct TestCategory {
    name: &'static str,
    description: &'static str,
    test_name: &'static str,
}

const TEST_CATEGORIES: &[TestCategory] = &[
    TestCategory {
        name: "NDR",
        description: "Codec round-trips, deferred pointers, aliasing, unions",
        test_name: "ndr_tests",
    },
    TestCategory {
        name: "Fragmentation",
        description: "Multi-fragment transfer and byte-exact reassembly",
        test_name: "fragmentation_tests",
    },
    TestCategory {
        name: "Multiplexing",
        description: "Concurrent calls, cancellation, connection loss",
        test_name: "multiplex_tests",
    },
    TestCategory {
        name: "Security",
        description: "Handshake legs, signing, sealing, tamper detection",
        test_name: "security_tests",
    },
    TestCategory {
        name: "End to end",
        description: "Pointer semantics, typed faults, alter-context",
        test_name: "endtoend_tests",
    },
];

fn main() {
    let mut failed = Vec::new();
    let started = Instant::now();

    for category in TEST_CATEGORIES {
        println!("==> {}: {}", category.name, category.description);
        let status = Command::new("cargo")
            .args([
                "test",
                "-p",
                "integration-tests",
                "--test",
                category.test_name,
            ])
            .status()
            .expect("failed to launch cargo");
        if !status.success() {
            failed.push(category.name);
        }
    }

    println!();
    println!(
        "{} categories in {:.1}s",
        TEST_CATEGORIES.len(),
        started.elapsed().as_secs_f64()
    );
    if failed.is_empty() {
        println!("all categories passed");
    } else {
        println!("FAILED: {}", failed.join(", "));
        std::process::exit(1);
    }
}
