//! Plain-text tables of the applied topology.

use std::fmt::Write as _;

use netlem::topology::{NodeSummary, RuleSummary};

pub(crate) fn nodes_table(nodes: &[NodeSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<4} {:<12} {:<16} {:<18} {:<18}",
        "ID", "NAME", "INTERFACE", "IPV4", "MAC"
    );
    for node in nodes {
        let _ = writeln!(
            out,
            "{:<4} {:<12} {:<16} {:<18} {:<18}",
            node.id,
            node.name,
            node.interface,
            node.ipv4.to_string(),
            node.mac
        );
    }
    out
}

pub(crate) fn rules_table(rules: &[RuleSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:<12} {:>10} {:>12} {:>8} {:>7}",
        "NODE", "PEER", "RATE(Mb)", "LATENCY(ms)", "LOSS(%)", "CLASS"
    );
    for rule in rules {
        let _ = writeln!(
            out,
            "{:<12} {:<12} {:>10} {:>12} {:>8.2} {:>7}",
            rule.node,
            rule.peer,
            rule.rate,
            rule.latency,
            rule.loss,
            rule.class_id.to_string()
        );
    }
    out
}
