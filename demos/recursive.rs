//! Recursive callbacks across the process boundary.
//!
//! This example demonstrates:
//! - Spawning a Python bond with the builder pattern
//! - Exporting typed host functions the peer can call
//! - Host and peer calling each other recursively on the same bond
//! - Capturing peer output through the host's stdout
//!
//! # Running
//!
//! ```text
//! RUST_LOG=bond_client=debug cargo run --example recursive
//! ```

use bond_client::{BindingError, Bond};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Result of one countdown step.
#[derive(Serialize, Debug)]
struct Step {
    side: &'static str,
    n: i64,
    rest: Value,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut py = Bond::builder().trans_except(true).spawn()?;
    println!("bootstrapped {} over {}", py.lang(), py.protocol());

    // host half of the countdown: hands n - 1 back to the peer
    py.export("host_countdown", |bond, args: Vec<Value>| {
        let n = args
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| BindingError::with_kind("TypeError", "expected an integer"))?;
        let rest = if n > 0 {
            bond.call("peer_countdown", (n - 1,))?
        } else {
            Value::Null
        };
        Ok(Step {
            side: "host",
            n,
            rest,
        })
    })?;

    py.eval_block(
        r#"
def peer_countdown(n):
    print("peer at", n)
    rest = host_countdown(n - 1) if n > 0 else None
    return {"side": "peer", "n": n, "rest": rest}
"#,
    )?;

    let chain = py.call("peer_countdown", (4,))?;
    println!("{}", serde_json::to_string_pretty(&chain)?);

    match py.call("host_countdown", ("four",)) {
        Err(e) => println!("expected failure: {}", e),
        Ok(v) => println!("unexpected success: {}", v),
    }

    py.close()?;
    Ok(())
}
