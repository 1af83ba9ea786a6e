//! Static command policy (C4): `classify()` maps a command name to a risk
//! class, a required-approval count, and an approval window. Pure and
//! stateless — it never consults app state or the store.

use ctl_schemas::{Policy, Risk};

const HIGH_RISK_WINDOW_SEC: i64 = 90;

const HIGH_RISK_COMMANDS: &[&str] = &[
    "orders.confirm",
    "orders.reject",
    "orders.confirm_all",
    "orders.cancel",
    "live.cancel",
];

/// Classify a dotted command name per the control policy table.
///
/// `state.pause`/`state.resume`/`state.stop`/`mode.switch` and any other
/// unrecognized name share the same `LOW`, single-approval classification —
/// unrecognized commands are not rejected here; `policy.denied` is a
/// worker-side decision about whether a handler exists at all.
pub fn classify(cmd_name: &str) -> Policy {
    if cmd_name == "stop.now" {
        return Policy {
            risk: Risk::Critical,
            required_approvals: 1,
            approval_window_sec: 0,
        };
    }

    if HIGH_RISK_COMMANDS.contains(&cmd_name) {
        return Policy {
            risk: Risk::High,
            required_approvals: 2,
            approval_window_sec: HIGH_RISK_WINDOW_SEC,
        };
    }

    Policy {
        risk: Risk::Low,
        required_approvals: 1,
        approval_window_sec: 0,
    }
}

/// Policy never trips the dual-control ledger for LOW/CRITICAL commands;
/// only HIGH-risk commands go through `offer_approval`.
pub fn requires_approval_ledger(policy: &Policy) -> bool {
    matches!(policy.risk, Risk::High)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_risk_state_commands_need_one_approval() {
        for cmd in ["state.pause", "state.resume", "state.stop", "mode.switch"] {
            let p = classify(cmd);
            assert_eq!(p.risk, Risk::Low);
            assert_eq!(p.required_approvals, 1);
        }
    }

    #[test]
    fn high_risk_order_commands_need_two_distinct_sources() {
        for cmd in [
            "orders.confirm",
            "orders.reject",
            "orders.confirm_all",
            "orders.cancel",
            "live.cancel",
        ] {
            let p = classify(cmd);
            assert_eq!(p.risk, Risk::High);
            assert_eq!(p.required_approvals, 2);
            assert_eq!(p.approval_window_sec, 90);
        }
    }

    #[test]
    fn stop_now_is_critical_single_approval() {
        let p = classify("stop.now");
        assert_eq!(p.risk, Risk::Critical);
        assert_eq!(p.required_approvals, 1);
    }

    #[test]
    fn unknown_commands_default_to_low() {
        let p = classify("totally.unknown.thing");
        assert_eq!(p.risk, Risk::Low);
        assert_eq!(p.required_approvals, 1);
    }

    #[test]
    fn only_high_risk_commands_use_the_approval_ledger() {
        assert!(!requires_approval_ledger(&classify("state.pause")));
        assert!(requires_approval_ledger(&classify("orders.confirm")));
        assert!(!requires_approval_ledger(&classify("stop.now")));
    }
}
