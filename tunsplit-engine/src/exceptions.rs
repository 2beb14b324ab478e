//! Building the exception set handed to enforcement

use ipnet::IpNet;
use tunsplit_dns::ResolvedHost;
use tunsplit_enforce::ExceptionSet;

pub use tunsplit_enforce::exception_routes;

/// Merge literal entries with every usable resolved address
///
/// Failed lookups and the `0.0.0.0` sentinel contribute nothing. The result
/// does not depend on input order.
pub fn build_exception_set<'a, L, R>(literals: L, resolved: R) -> ExceptionSet
where
    L: IntoIterator<Item = &'a IpNet>,
    R: IntoIterator<Item = &'a ResolvedHost>,
{
    let mut set: ExceptionSet = literals.into_iter().copied().collect();

    for host in resolved {
        if host.error {
            continue;
        }
        for ip in host.usable_addresses() {
            set.insert_addr(ip);
        }
        if host.addresses.iter().any(tunsplit_dns::is_blocked_sentinel) {
            log::debug!("{} resolved to the blocked sentinel, ignored", host.hostname);
        }
    }

    set
}
