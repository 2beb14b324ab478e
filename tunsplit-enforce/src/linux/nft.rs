//! nftables scripts for exceptions and the per-app mark
//!
//! Every script is applied with `nft -f -` as one transaction and only uses
//! `add` for objects plus `flush` for contents, so re-applying is harmless.

use std::fmt::Write;

use crate::types::ExceptionSet;

pub(crate) const SET_V4: &str = "exceptions_v4";
pub(crate) const SET_V6: &str = "exceptions_v6";
pub(crate) const EXCEPTION_CHAIN: &str = "allow_exceptions";
pub(crate) const REDIRECT_CHAIN: &str = "mark_apps";

/// Check a table name before splicing it into a script
pub(crate) fn valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Replace the contents of both exception sets and (re)build the accept chain
pub(crate) fn exceptions_script(table: &str, set: &ExceptionSet) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "add table inet {}", table);
    let _ = writeln!(
        s,
        "add set inet {} {} {{ type ipv4_addr; flags interval; }}",
        table, SET_V4
    );
    let _ = writeln!(
        s,
        "add set inet {} {} {{ type ipv6_addr; flags interval; }}",
        table, SET_V6
    );
    let _ = writeln!(
        s,
        "add chain inet {} {} {{ type filter hook output priority -1; policy accept; }}",
        table, EXCEPTION_CHAIN
    );
    let _ = writeln!(s, "flush chain inet {} {}", table, EXCEPTION_CHAIN);
    let _ = writeln!(s, "flush set inet {} {}", table, SET_V4);
    let _ = writeln!(s, "flush set inet {} {}", table, SET_V6);

    let v4: Vec<String> = set.ipv4().map(|n| n.to_string()).collect();
    if !v4.is_empty() {
        let _ = writeln!(
            s,
            "add element inet {} {} {{ {} }}",
            table,
            SET_V4,
            v4.join(", ")
        );
    }
    let v6: Vec<String> = set.ipv6().map(|n| n.to_string()).collect();
    if !v6.is_empty() {
        let _ = writeln!(
            s,
            "add element inet {} {} {{ {} }}",
            table,
            SET_V6,
            v6.join(", ")
        );
    }

    let _ = writeln!(
        s,
        "add rule inet {} {} ip daddr @{} accept",
        table, EXCEPTION_CHAIN, SET_V4
    );
    let _ = writeln!(
        s,
        "add rule inet {} {} ip6 daddr @{} accept",
        table, EXCEPTION_CHAIN, SET_V6
    );
    s
}

/// Mark every packet leaving the redirect cgroup with `fwmark`
pub(crate) fn redirect_script(table: &str, classid: u32, fwmark: u32) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "add table inet {}", table);
    let _ = writeln!(
        s,
        "add chain inet {} {} {{ type route hook output priority mangle; policy accept; }}",
        table, REDIRECT_CHAIN
    );
    let _ = writeln!(s, "flush chain inet {} {}", table, REDIRECT_CHAIN);
    let _ = writeln!(
        s,
        "add rule inet {} {} meta cgroup {:#010x} meta mark set {:#x}",
        table, REDIRECT_CHAIN, classid, fwmark
    );
    s
}

/// Drop the mark rule but keep the chain
pub(crate) fn clear_redirect_script(table: &str) -> String {
    format!(
        "add table inet {t}\n\
         add chain inet {t} {c} {{ type route hook output priority mangle; policy accept; }}\n\
         flush chain inet {t} {c}\n",
        t = table,
        c = REDIRECT_CHAIN
    )
}

/// Remove the whole table; `add` first so deleting a missing table succeeds
pub(crate) fn teardown_script(table: &str) -> String {
    format!("add table inet {t}\ndelete table inet {t}\n", t = table)
}
