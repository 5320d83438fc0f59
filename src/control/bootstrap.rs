//! Two-stage bootstrap handshake.
//!
//! Turns a freshly spawned interactive prompt into a frame-speaking peer:
//!
//! 1. Probe: type the driver's probe and wait for its sentinel line.
//! 2. Stage 1: type the reduced loader and wait for `STAGE2` (or
//!    `STAGE2 RAW`, which switches the transport to raw mode).
//! 3. Stage 2: send `{"code": ..., "start": [protocol, trans_except]}` as
//!    one JSON line and wait for `READY`.
//!
//! Sentinels are matched with their line terminator so that input echoed
//! by the prompt (which carries the same words followed by quotes or
//! escapes) never satisfies them.

use regex::bytes::Regex;
use serde_json::json;

use super::Driver;
use crate::codec::Protocol;
use crate::error::{BondError, Result};
use crate::transport::Transport;

/// Outcome of a successful bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Negotiated serialization protocol.
    pub protocol: Protocol,
    /// The transport was switched to raw mode.
    pub raw: bool,
}

/// Run the full handshake on `transport`: [`probe`], then [`inject`].
///
/// # Errors
///
/// Returns [`BondError::Bootstrap`] naming the failed stage. The transport
/// must not be reused afterwards.
pub fn run(
    transport: &mut dyn Transport,
    driver: &Driver,
    requested: Option<Protocol>,
    trans_except: bool,
) -> Result<Handshake> {
    negotiate(driver, requested)?;
    probe(transport, driver)?;
    inject(transport, driver, requested, trans_except)
}

/// Pick the serialization protocol for `driver`.
pub fn negotiate(driver: &Driver, requested: Option<Protocol>) -> Result<Protocol> {
    Protocol::negotiate(&driver.protocols, requested).ok_or_else(|| BondError::Bootstrap {
        stage: "negotiate",
        reason: format!(
            "no common serialization protocol (driver supports {:?}, requested {:?})",
            driver.protocols, requested
        ),
        output: String::new(),
    })
}

/// Check the interactive prompt is alive.
///
/// Returns whether the prompt terminates lines with `\r\n`.
pub fn probe(transport: &mut dyn Transport, driver: &Driver) -> Result<bool> {
    let pattern = pattern("probe", &format!("{}(\r?)\n", regex::escape(&driver.sentinel)))?;
    transport.drain().map_err(|e| failed("probe", e, transport))?;
    transport
        .send_line(driver.probe.as_bytes())
        .map_err(|e| failed("probe", e, transport))?;
    let found = transport.expect(&pattern).map_err(|e| match e {
        BondError::Timeout { pending } => BondError::Bootstrap {
            stage: "probe",
            reason: String::from("cannot get an interactive prompt"),
            output: pending,
        },
        other => failed("probe", other, transport),
    })?;
    let crlf = found
        .groups
        .first()
        .and_then(Option::as_deref)
        .map_or(false, |cr| !cr.is_empty());
    tracing::debug!(driver = %driver.name, crlf, "interactive prompt answered the probe");
    Ok(crlf)
}

/// Inject stage 1 and stage 2 into a probed prompt.
pub fn inject(
    transport: &mut dyn Transport,
    driver: &Driver,
    requested: Option<Protocol>,
    trans_except: bool,
) -> Result<Handshake> {
    let protocol = negotiate(driver, requested)?;

    // stage 1
    let pattern = pattern("stage1", "STAGE2( RAW)?\r?\n")?;
    transport.drain().map_err(|e| failed("stage1", e, transport))?;
    transport
        .send_line(driver.reduce_stage1().as_bytes())
        .map_err(|e| failed("stage1", e, transport))?;
    let found = transport
        .expect(&pattern)
        .map_err(|e| failed("stage1", e, transport))?;
    let raw = found.groups.first().map_or(false, Option::is_some);
    if raw {
        transport
            .set_raw_mode()
            .map_err(|e| failed("stage1", e, transport))?;
    }
    tracing::debug!(raw, "stage 1 loader is waiting for stage 2");

    // stage 2
    let envelope = json!({
        "code": driver.stage2,
        "start": [protocol.id(), trans_except],
    });
    let line = serde_json::to_string(&envelope).map_err(|e| BondError::Bootstrap {
        stage: "stage2",
        reason: e.to_string(),
        output: String::new(),
    })?;
    let pattern = self::pattern("stage2", "READY\r?\n")?;
    transport
        .send_line(line.as_bytes())
        .map_err(|e| failed("stage2", e, transport))?;
    transport
        .expect(&pattern)
        .map_err(|e| failed("stage2", e, transport))?;
    tracing::debug!(%protocol, trans_except, "peer ready");

    Ok(Handshake { protocol, raw })
}

fn pattern(stage: &'static str, source: &str) -> Result<Regex> {
    Regex::new(source).map_err(|e| BondError::Bootstrap {
        stage,
        reason: format!("invalid sentinel pattern: {}", e),
        output: String::new(),
    })
}

fn failed(stage: &'static str, err: BondError, transport: &dyn Transport) -> BondError {
    let output = match &err {
        BondError::Timeout { pending } => pending.clone(),
        _ => transport.pending(),
    };
    let reason = match err {
        BondError::Timeout { .. } => String::from("timed out"),
        other => other.to_string(),
    };
    BondError::Bootstrap {
        stage,
        reason,
        output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::{scripted, Peer};

    fn loader_driver() -> Driver {
        Driver {
            name: String::from("Test"),
            commands: Vec::new(),
            probe: String::from("probe()"),
            sentinel: String::from("BOND"),
            comment: String::from("#"),
            stage1: String::from("# loader\nload();\nrun();\n"),
            stage2: String::from("loop()"),
            protocols: vec![Protocol::MsgPack, Protocol::Json],
            env: Vec::new(),
        }
    }

    /// Plays a well-behaved prompt, echoing everything it reads.
    fn prompt(peer: &Peer, raw: bool) {
        let probe = peer.recv_raw().unwrap();
        assert_eq!(probe, "probe()");
        peer.send_raw(&format!(">>> {}\r\nBOND\r\n>>> ", probe));

        let stage1 = peer.recv_raw().unwrap();
        assert_eq!(stage1, "load(); run();");
        peer.send_raw(&format!("{}\r\n", stage1));
        peer.send_raw(if raw { "STAGE2 RAW\n" } else { "STAGE2\r\n" });

        let envelope: serde_json::Value = serde_json::from_str(&peer.recv_raw().unwrap()).unwrap();
        assert_eq!(envelope["code"], "loop()");
        let start = envelope["start"].clone();
        peer.send_raw("READY\n");
        peer.send_raw(&format!("RETURN {}\n", start));
    }

    #[test]
    fn test_bootstrap_negotiates_and_switches_to_raw() {
        let mut transport = scripted(|peer| prompt(&peer, true));

        let handshake = run(&mut transport, &loader_driver(), None, true).unwrap();
        assert_eq!(
            handshake,
            Handshake {
                protocol: Protocol::MsgPack,
                raw: true,
            }
        );
        assert!(transport.is_raw());

        // framing resumes right after READY
        let line = transport.read_line().unwrap();
        assert_eq!(&line[..], br#"RETURN ["MSGPACK",true]"#);
    }

    #[test]
    fn test_bootstrap_requested_protocol() {
        let mut transport = scripted(|peer| prompt(&peer, false));

        let handshake =
            run(&mut transport, &loader_driver(), Some(Protocol::Json), false).unwrap();
        assert_eq!(handshake.protocol, Protocol::Json);
        assert!(!handshake.raw);
        assert!(!transport.is_raw());

        let line = transport.read_line().unwrap();
        assert_eq!(&line[..], br#"RETURN ["JSON",false]"#);
    }

    #[test]
    fn test_bootstrap_no_common_protocol() {
        let mut transport = scripted(|_peer| {});
        let driver = Driver {
            protocols: Vec::new(),
            ..loader_driver()
        };

        let err = run(&mut transport, &driver, None, false).unwrap_err();
        assert!(matches!(err, BondError::Bootstrap { stage: "negotiate", .. }));
    }

    #[test]
    fn test_bootstrap_echo_does_not_satisfy_probe() {
        let mut transport = scripted(|peer| {
            let probe = peer.recv_raw().unwrap();
            // echo only, the prompt never evaluates anything
            peer.send_raw(&format!("{} BOND", probe));
            peer.hold();
        });
        transport.set_timeout(Some(std::time::Duration::from_millis(200)));

        let err = run(&mut transport, &loader_driver(), None, false).unwrap_err();
        match err {
            BondError::Bootstrap {
                stage,
                reason,
                output,
            } => {
                assert_eq!(stage, "probe");
                assert_eq!(reason, "cannot get an interactive prompt");
                assert_eq!(output, "probe() BOND");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_bootstrap_peer_exits_during_stage1() {
        let mut transport = scripted(|peer| {
            peer.recv_raw().unwrap();
            peer.send_raw("BOND\n");
            peer.recv_raw().unwrap();
            peer.send_raw("SyntaxError: invalid syntax\n");
        });

        let err = run(&mut transport, &loader_driver(), None, false).unwrap_err();
        match err {
            BondError::Bootstrap { stage, output, .. } => {
                assert_eq!(stage, "stage1");
                assert!(output.contains("SyntaxError"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
