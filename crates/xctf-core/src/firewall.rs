//! C4: firewall controller over `nft` (nftables), driven entirely through
//! the `nft` CLI rather than a netlink binding, matching
//! `original_source/services/firewall_service.py::_run_nftables_command`.
//!
//! Table/set/map/chain layout, rule order, and the tokenizer regex are
//! carried over unchanged: prerouting happens before NAT (priority -300),
//! the input chain filters again before the rest of the firewall runs
//! (priority -100), and non-sandbox ports are always let through untouched.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;

use crate::error::{Error, Result};

const TABLE: &str = "xctf";
const CHAIN: &str = "sandbox_access";
const MAP: &str = "sandbox_port_to_ip";
const STATIC_PORTS_SET: &str = "static_ports";
const SANDBOX_PORTS_SET: &str = "sandbox_ports";
const SANDBOX_PORT_RANGE: (u16, u16) = (32768, 65535);

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^}]*\}|\S+").unwrap());
static ELEMENTS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"elements\s*=\s*\{([^}]+)\}").unwrap());
static PORT_RANGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)(?:-(\d+))?").unwrap());

/// C4's capability surface. Split out so `engine`/`session` tests can run
/// against [`fake::FakeFirewall`] instead of shelling out to `nft`, which
/// needs `CAP_NET_ADMIN` most CI runners don't grant.
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn ensure_initialized(&self) -> Result<()>;
    async fn add_port_ip_mapping(&self, port: u16, ip: &str) -> Result<()>;
    async fn remove_port_ip_mapping(&self, port: u16, ip: &str) -> Result<()>;
    async fn add_static_port(&self, port: u16) -> Result<()>;
    async fn remove_static_port(&self, port: u16) -> Result<()>;
    async fn remove_sandbox_port(&self, port: u16) -> Result<()>;
    async fn remove_all_mappings_for_sandbox(&self, ports: &[u16]) -> Result<()>;
    async fn clean_orphan_ports(&self, active_ports: &HashSet<u16>) -> Result<usize>;
}

#[derive(Clone)]
pub struct FirewallController {
    rules_file: std::path::PathBuf,
}

impl FirewallController {
    pub fn new(rules_file: impl Into<std::path::PathBuf>) -> Self {
        Self {
            rules_file: rules_file.into(),
        }
    }

    /// Tokenizes the same way the original's regex does: `{ ... }` literals
    /// stay one token, everything else splits on whitespace. Preserves the
    /// set/map-element braces nftables syntax requires.
    fn tokenize(command: &str) -> Vec<String> {
        TOKEN_RE
            .find_iter(command)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    async fn run(&self, command: &str, check: bool) -> Result<(bool, String)> {
        let tokens = Self::tokenize(command);
        let output = tokio::time::timeout(
            Duration::from_secs(10),
            Command::new("sudo").arg("nft").args(&tokens).output(),
        )
        .await
        .map_err(|_| Error::FirewallRuleError(format!("nftables command timed out: {command}")))?
        .map_err(|e| Error::FirewallRuleError(e.to_string()))?;

        if !output.status.success() {
            let msg = if !output.stderr.is_empty() {
                String::from_utf8_lossy(&output.stderr).trim().to_string()
            } else {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            };
            if check {
                return Err(Error::FirewallRuleError(msg));
            }
            return Ok((false, msg));
        }
        Ok((true, String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    /// Idempotent: a table that already exists is left alone, same as the
    /// original's `list table` probe before creating anything.
    pub async fn ensure_initialized(&self) -> Result<()> {
        if self.run("list table inet xctf", false).await?.0 {
            return Ok(());
        }

        self.run("add table inet xctf", true).await?;
        self.run(
            &format!("add map inet xctf {MAP} {{ type inet_service . ipv4_addr : verdict; }}"),
            true,
        )
        .await?;
        self.run(
            &format!("add set inet xctf {STATIC_PORTS_SET} {{ type inet_service; flags interval; }}"),
            true,
        )
        .await?;
        self.run(
            &format!("add set inet xctf {SANDBOX_PORTS_SET} {{ type inet_service; flags interval; }}"),
            true,
        )
        .await?;

        let prerouting = format!("{CHAIN}_prerouting");
        self.run(
            &format!("add chain inet xctf {prerouting} {{ type filter hook prerouting priority -300; policy accept; }}"),
            true,
        )
        .await?;
        self.run(
            &format!("add rule inet xctf {prerouting} tcp dport != @{SANDBOX_PORTS_SET} counter accept"),
            true,
        )
        .await?;
        self.run(
            &format!(
                "add rule inet xctf {prerouting} tcp dport @{STATIC_PORTS_SET} counter log prefix \"[XCTF-PREROUTING-STATIC] \" accept"
            ),
            true,
        )
        .await?;
        self.run(
            &format!(
                "add rule inet xctf {prerouting} tcp dport @{SANDBOX_PORTS_SET} tcp dport != @{STATIC_PORTS_SET} counter tcp dport . ip saddr vmap @{MAP}"
            ),
            true,
        )
        .await?;
        self.run(
            &format!(
                "add rule inet xctf {prerouting} tcp dport @{SANDBOX_PORTS_SET} tcp dport != @{STATIC_PORTS_SET} counter log prefix \"[XCTF-PREROUTING-REJECT] \" reject with tcp reset"
            ),
            true,
        )
        .await?;

        self.run(
            &format!("add chain inet xctf {CHAIN} {{ type filter hook input priority -100; policy accept; }}"),
            true,
        )
        .await?;
        self.run(
            &format!(
                "add rule inet xctf {CHAIN} tcp dport != @{SANDBOX_PORTS_SET} counter log prefix \"[XCTF-ACCEPT-NON-SANDBOX] \" accept"
            ),
            true,
        )
        .await?;
        self.run(
            &format!(
                "add rule inet xctf {CHAIN} tcp dport @{STATIC_PORTS_SET} counter log prefix \"[XCTF-ACCEPT-STATIC] \" accept"
            ),
            true,
        )
        .await?;
        self.run(
            &format!(
                "add rule inet xctf {CHAIN} tcp dport @{SANDBOX_PORTS_SET} tcp dport != @{STATIC_PORTS_SET} counter tcp dport . ip saddr vmap @{MAP}"
            ),
            true,
        )
        .await?;
        self.run(
            &format!(
                "add rule inet xctf {CHAIN} tcp dport @{SANDBOX_PORTS_SET} tcp dport != @{STATIC_PORTS_SET} counter log prefix \"[XCTF-REJECT] \" reject with tcp reset"
            ),
            true,
        )
        .await?;

        Ok(())
    }

    pub async fn add_port_ip_mapping(&self, port: u16, ip: &str) -> Result<()> {
        self.ensure_initialized().await?;
        self.run(
            &format!("add element inet xctf {SANDBOX_PORTS_SET} {{ {port} }}"),
            false,
        )
        .await?;
        self.run(
            &format!("add element inet xctf {MAP} {{ {port} . {ip} : accept }}"),
            true,
        )
        .await?;
        Ok(())
    }

    pub async fn remove_port_ip_mapping(&self, port: u16, ip: &str) -> Result<()> {
        self.run(
            &format!("delete element inet xctf {MAP} {{ {port} . {ip} : accept }}"),
            false,
        )
        .await?;
        Ok(())
    }

    pub async fn add_static_port(&self, port: u16) -> Result<()> {
        self.ensure_initialized().await?;
        self.run(
            &format!("add element inet xctf {STATIC_PORTS_SET} {{ {port} }}"),
            true,
        )
        .await?;
        Ok(())
    }

    pub async fn remove_static_port(&self, port: u16) -> Result<()> {
        self.run(
            &format!("delete element inet xctf {STATIC_PORTS_SET} {{ {port} }}"),
            false,
        )
        .await?;
        Ok(())
    }

    pub async fn remove_sandbox_port(&self, port: u16) -> Result<()> {
        self.run(
            &format!("delete element inet xctf {SANDBOX_PORTS_SET} {{ {port} }}"),
            false,
        )
        .await?;
        Ok(())
    }

    /// Removes every set/map entry touching any port a sandbox used,
    /// including its extra `port_mappings` ports, not just the primary one.
    pub async fn remove_all_mappings_for_sandbox(&self, ports: &[u16]) -> Result<()> {
        let (_, map_output) = self.run(&format!("list map inet xctf {MAP}"), false).await?;
        for &port in ports {
            self.run(
                &format!("delete element inet xctf {SANDBOX_PORTS_SET} {{ {port} }}"),
                false,
            )
            .await?;
            self.run(
                &format!("delete element inet xctf {STATIC_PORTS_SET} {{ {port} }}"),
                false,
            )
            .await?;
            for ip in map_entries_for_port(&map_output, port) {
                self.run(
                    &format!("delete element inet xctf {MAP} {{ {port} . {ip} : accept }}"),
                    false,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// §4.7 orphan sweep: diff the live `sandbox_ports` set against the set
    /// of ports that should still be open, and delete the rest.
    pub async fn clean_orphan_ports(&self, active_ports: &HashSet<u16>) -> Result<usize> {
        let (success, output) = self
            .run(&format!("list set inet xctf {SANDBOX_PORTS_SET}"), false)
            .await?;
        if !success {
            return Ok(0);
        }

        let current = parse_port_set(&output);
        let orphans: Vec<u16> = current.difference(active_ports).copied().collect();

        for &port in &orphans {
            self.run(
                &format!("delete element inet xctf {SANDBOX_PORTS_SET} {{ {port} }}"),
                false,
            )
            .await?;
            self.run(
                &format!("delete element inet xctf {STATIC_PORTS_SET} {{ {port} }}"),
                false,
            )
            .await?;
            let (map_success, map_output) = self.run(&format!("list map inet xctf {MAP}"), false).await?;
            if map_success {
                for ip in map_entries_for_port(&map_output, port) {
                    self.run(
                        &format!("delete element inet xctf {MAP} {{ {port} . {ip} : accept }}"),
                        false,
                    )
                    .await?;
                }
            }
        }
        Ok(orphans.len())
    }

    pub async fn save_rules_to_file(&self) -> Result<()> {
        let (success, output) = self.run("list table inet xctf", true).await?;
        if !success {
            return Err(Error::FirewallRuleError("failed to list table".into()));
        }
        let contents = format!(
            "# xctf firewall rules\n# generated {}\n\n{}",
            chrono::Utc::now().to_rfc3339(),
            output
        );
        tokio::fs::write(&self.rules_file, contents)
            .await
            .map_err(|e| Error::FirewallRuleError(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Firewall for FirewallController {
    async fn ensure_initialized(&self) -> Result<()> {
        FirewallController::ensure_initialized(self).await
    }

    async fn add_port_ip_mapping(&self, port: u16, ip: &str) -> Result<()> {
        FirewallController::add_port_ip_mapping(self, port, ip).await
    }

    async fn remove_port_ip_mapping(&self, port: u16, ip: &str) -> Result<()> {
        FirewallController::remove_port_ip_mapping(self, port, ip).await
    }

    async fn add_static_port(&self, port: u16) -> Result<()> {
        FirewallController::add_static_port(self, port).await
    }

    async fn remove_static_port(&self, port: u16) -> Result<()> {
        FirewallController::remove_static_port(self, port).await
    }

    async fn remove_sandbox_port(&self, port: u16) -> Result<()> {
        FirewallController::remove_sandbox_port(self, port).await
    }

    async fn remove_all_mappings_for_sandbox(&self, ports: &[u16]) -> Result<()> {
        FirewallController::remove_all_mappings_for_sandbox(self, ports).await
    }

    async fn clean_orphan_ports(&self, active_ports: &HashSet<u16>) -> Result<usize> {
        FirewallController::clean_orphan_ports(self, active_ports).await
    }
}

/// In-memory [`Firewall`] for tests: tracks `(port, ip)` accepts,
/// `sandbox_ports`/`static_ports` membership, and call counts, without ever
/// invoking `nft`.
pub mod fake {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default)]
    struct State {
        sandbox_ports: HashSet<u16>,
        static_ports: HashSet<u16>,
        map: HashSet<(u16, String)>,
    }

    /// Cloning shares the underlying state (`Arc`-backed), so a test can hand
    /// out one [`FakeFirewall`] to an engine, a session registry, and a
    /// scheduler and see each other's writes, the way they all share one
    /// `nft` table in production.
    #[derive(Clone, Default)]
    pub struct FakeFirewall {
        state: Arc<StdMutex<State>>,
    }

    impl FakeFirewall {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn has_mapping(&self, port: u16, ip: &str) -> bool {
            self.state.lock().unwrap().map.contains(&(port, ip.to_string()))
        }

        pub fn sandbox_ports(&self) -> HashSet<u16> {
            self.state.lock().unwrap().sandbox_ports.clone()
        }

        pub fn static_ports(&self) -> HashSet<u16> {
            self.state.lock().unwrap().static_ports.clone()
        }
    }

    #[async_trait]
    impl Firewall for FakeFirewall {
        async fn ensure_initialized(&self) -> Result<()> {
            Ok(())
        }

        async fn add_port_ip_mapping(&self, port: u16, ip: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.sandbox_ports.insert(port);
            state.map.insert((port, ip.to_string()));
            Ok(())
        }

        async fn remove_port_ip_mapping(&self, port: u16, ip: &str) -> Result<()> {
            self.state.lock().unwrap().map.remove(&(port, ip.to_string()));
            Ok(())
        }

        async fn add_static_port(&self, port: u16) -> Result<()> {
            self.state.lock().unwrap().static_ports.insert(port);
            Ok(())
        }

        async fn remove_static_port(&self, port: u16) -> Result<()> {
            self.state.lock().unwrap().static_ports.remove(&port);
            Ok(())
        }

        async fn remove_sandbox_port(&self, port: u16) -> Result<()> {
            self.state.lock().unwrap().sandbox_ports.remove(&port);
            Ok(())
        }

        async fn remove_all_mappings_for_sandbox(&self, ports: &[u16]) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            for &port in ports {
                state.sandbox_ports.remove(&port);
                state.static_ports.remove(&port);
                state.map.retain(|(p, _)| *p != port);
            }
            Ok(())
        }

        async fn clean_orphan_ports(&self, active_ports: &HashSet<u16>) -> Result<usize> {
            let mut state = self.state.lock().unwrap();
            let orphans: Vec<u16> = state.sandbox_ports.difference(active_ports).copied().collect();
            for port in &orphans {
                state.sandbox_ports.remove(port);
                state.static_ports.remove(port);
                state.map.retain(|(p, _)| p != port);
            }
            Ok(orphans.len())
        }
    }
}

fn parse_port_set(nft_output: &str) -> HashSet<u16> {
    let mut ports = HashSet::new();
    let Some(caps) = ELEMENTS_RE.captures(nft_output) else {
        return ports;
    };
    for m in PORT_RANGE_RE.captures_iter(&caps[1]) {
        let Ok(start) = m[1].parse::<u16>() else { continue };
        let end = m
            .get(2)
            .and_then(|g| g.as_str().parse::<u16>().ok())
            .unwrap_or(start);
        for port in start..=end {
            if port >= SANDBOX_PORT_RANGE.0 && port <= SANDBOX_PORT_RANGE.1 {
                ports.insert(port);
            }
        }
    }
    ports
}

fn map_entries_for_port(map_output: &str, port: u16) -> Vec<String> {
    let pattern = format!(r"\b{port}\s+\.\s+(\d+\.\d+\.\d+\.\d+)\s+:\s+accept");
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    re.captures_iter(map_output)
        .map(|c| c[1].to_string())
        .collect()
}

/// Extracts the caller's real IP the way the original does: trust
/// `X-Forwarded-For`'s first hop, then `X-Real-IP`, then the socket peer.
pub fn client_ip(forwarded_for: Option<&str>, real_ip: Option<&str>, remote_addr: Option<&str>) -> String {
    if let Some(xff) = forwarded_for {
        if let Some(first) = xff.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }
    if let Some(real_ip) = real_ip {
        if !real_ip.trim().is_empty() {
            return real_ip.trim().to_string();
        }
    }
    remote_addr.unwrap_or("0.0.0.0").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_keeps_braces_as_one_token() {
        let tokens = FirewallController::tokenize("add element inet xctf sandbox_ports { 32800 }");
        assert_eq!(
            tokens,
            vec!["add", "element", "inet", "xctf", "sandbox_ports", "{ 32800 }"]
        );
    }

    #[test]
    fn parse_port_set_expands_ranges_within_bounds() {
        let output = "set sandbox_ports {\n    type inet_service\n    elements = { 32800, 33000-33002 }\n}";
        let ports = parse_port_set(output);
        assert!(ports.contains(&32800));
        assert!(ports.contains(&33000));
        assert!(ports.contains(&33002));
        assert_eq!(ports.len(), 4);
    }

    #[test]
    fn map_entries_for_port_extracts_ips() {
        let output = "map sandbox_port_to_ip {\n  elements = { 32800 . 10.0.0.5 : accept, 32800 . 10.0.0.9 : accept }\n}";
        let ips = map_entries_for_port(output, 32800);
        assert_eq!(ips, vec!["10.0.0.5".to_string(), "10.0.0.9".to_string()]);
    }

    #[test]
    fn client_ip_prefers_forwarded_for_first_hop() {
        assert_eq!(
            client_ip(Some("1.2.3.4, 5.6.7.8"), Some("9.9.9.9"), Some("10.10.10.10")),
            "1.2.3.4"
        );
        assert_eq!(client_ip(None, Some("9.9.9.9"), Some("10.10.10.10")), "9.9.9.9");
        assert_eq!(client_ip(None, None, Some("10.10.10.10")), "10.10.10.10");
        assert_eq!(client_ip(None, None, None), "0.0.0.0");
    }
}
