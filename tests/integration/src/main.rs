//! Integration test harness
//!
//! Runs every test category as a `cargo test` subprocess and reports a
//! summary.
//!
//! # Usage
//!
//! Run all categories:
//! ```
//! cargo run -p integration-tests
//! ```
//!
//! Run one category directly:
//! ```
//! cargo test -p integration-tests --test ticket_tests
//! ```
//!
//! Run with increased logging:
//! ```
//! RUST_LOG=debug cargo test -p integration-tests --test link_tests
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
        name: "Link Tests",
        description: "Init handshake, reflective dispatch, error propagation",
        test_name: "link_tests",
    },
    TestCategory {
        name: "Ticket Tests",
        description: "Query correlation under concurrency",
        test_name: "ticket_tests",
    },
    TestCategory {
        name: "Fan-out Tests",
        description: "Session subscriptions and update delivery",
        test_name: "fanout_tests",
    },
    TestCategory {
        name: "Reconnect Tests",
        description: "Link drops, re-registration, pending-call flush",
        test_name: "reconnect_tests",
    },
];

fn main() {
    println!("object link integration tests");
    println!("{}", "-".repeat(72));
    for cat in TEST_CATEGORIES {
        println!("  {} - {}", cat.name, cat.description);
    }
    println!("{}", "-".repeat(72));

    let mut failed = Vec::new();
    let started = Instant::now();

    for cat in TEST_CATEGORIES {
        println!("running {} ...", cat.test_name);
        let run = Instant::now();
        let status = Command::new("cargo")
            .args(["test", "-p", "integration-tests", "--test", cat.test_name])
            .status();

        match status {
            Ok(status) if status.success() => {
                println!("{} ok ({:.1}s)", cat.test_name, run.elapsed().as_secs_f32());
            }
            Ok(_) => {
                println!(
                    "{} FAILED ({:.1}s)",
                    cat.test_name,
                    run.elapsed().as_secs_f32()
                );
                failed.push(cat.name);
            }
            Err(e) => {
                println!("{} could not run: {}", cat.test_name, e);
                failed.push(cat.name);
            }
        }
    }

    println!("{}", "-".repeat(72));
    if failed.is_empty() {
        println!(
            "all {} categories passed in {:.1}s",
            TEST_CATEGORIES.len(),
            started.elapsed().as_secs_f32()
        );
    } else {
        println!("{} categories failed: {}", failed.len(), failed.join(", "));
        std::process::exit(1);
    }
}
