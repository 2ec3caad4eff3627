//! Renders the shell scripts run on VMs via the Command Channel, and parses
//! their output. Every script is self-preflighting and idempotent (§9):
//! re-running it after a crash must be safe.

use regex::Regex;
use std::sync::OnceLock;

pub const TOKEN_START: &str = "===TOKEN_START===";
pub const TOKEN_END: &str = "===TOKEN_END===";

const CLUSTER_CIDR: &str = "10.42.0.0/16";
const SERVICE_CIDR: &str = "10.43.0.0/16";
const CLUSTER_DNS: &str = "10.43.0.10";

fn install_channel(k3s_version: Option<&str>) -> String {
    match k3s_version {
        Some(v) => format!("curl -sfL https://get.k3s.io | INSTALL_K3S_VERSION={v} sh -s -"),
        None => "curl -sfL https://get.k3s.io | sh -s -".to_string(),
    }
}

/// Idempotent check used by every script: the install step is skipped
/// entirely if the binary and unit are already present (§4.8.4).
fn already_installed_guard() -> &'static str {
    r#"if command -v k3s >/dev/null 2>&1 && systemctl is-enabled k3s >/dev/null 2>&1; then
  echo "k3s already installed, skipping install step"
  exit 0
fi"#
}

/// Dev-mode single master (§4.8.5): cluster-init, tls-san = own private IP,
/// Traefik disabled, kubeconfig mode 0644.
pub fn dev_master_install_script(private_ip: &str, k3s_version: Option<&str>) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail
{guard}
{install}
mkdir -p /etc/rancher/k3s
cat > /etc/rancher/k3s/config.yaml <<'EOF'
cluster-init: true
tls-san:
  - {private_ip}
node-ip: {private_ip}
write-kubeconfig-mode: "0644"
disable:
  - traefik
EOF
systemctl enable --now k3s
for i in $(seq 1 60); do
  systemctl is-active --quiet k3s && break
  sleep 2
done
cat /var/lib/rancher/k3s/server/node-token
"#,
        guard = already_installed_guard(),
        install = install_channel(k3s_version),
        private_ip = private_ip,
    )
}

/// Reads the already-running master's kubeconfig (§4.8.5 step 2); the
/// `127.0.0.1` → public-IP rewrite happens in Rust, not in the script.
pub fn read_kubeconfig_script() -> &'static str {
    "cat /etc/rancher/k3s/k3s.yaml"
}

pub fn rewrite_kubeconfig_server(kubeconfig: &str, public_ip: &str) -> String {
    kubeconfig.replace("https://127.0.0.1:6443", &format!("https://{public_ip}:6443"))
}

/// HA seed bring-up (§4.8.6 step 1): purges stale state, installs with
/// `cluster-init`, polls until serving, prints the token bracketed by
/// unambiguous markers.
pub fn ha_seed_script(private_ip: &str, k3s_version: Option<&str>) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail
{guard}
systemctl stop k3s 2>/dev/null || true
rm -rf /var/lib/rancher/k3s/server/db 2>/dev/null || true
{install}
mkdir -p /etc/rancher/k3s
cat > /etc/rancher/k3s/config.yaml <<'EOF'
cluster-init: true
cluster-cidr: {cluster_cidr}
service-cidr: {service_cidr}
cluster-dns: {cluster_dns}
node-ip: {private_ip}
disable:
  - traefik
EOF
systemctl enable --now k3s
for i in $(seq 1 90); do
  if systemctl is-active --quiet k3s \
     && curl -sk https://127.0.0.1:6443/livez >/dev/null 2>&1 \
     && k3s kubectl get nodes >/dev/null 2>&1; then
    break
  fi
  sleep 2
done
echo "{token_start}"
cat /var/lib/rancher/k3s/server/node-token
echo "{token_end}"
"#,
        guard = already_installed_guard(),
        install = install_channel(k3s_version),
        cluster_cidr = CLUSTER_CIDR,
        service_cidr = SERVICE_CIDR,
        cluster_dns = CLUSTER_DNS,
        private_ip = private_ip,
        token_start = TOKEN_START,
        token_end = TOKEN_END,
    )
}

/// Follow-up read used when the marker-bracketed output from the seed
/// script itself was lost (the second fallback in the three-tier chain,
/// §9 "token parsing robustness").
pub fn read_seed_token_script() -> &'static str {
    "cat /var/lib/rancher/k3s/server/node-token"
}

/// HA joiner (§4.8.6 steps 1-3). Reads its own IP dynamically, preflights
/// the seed's reachability before installing, force-joins via `--server`
/// and `--token`.
pub fn ha_joiner_script(seed_private_ip: &str, token: &str, k3s_version: Option<&str>) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail
{guard}
systemctl stop k3s 2>/dev/null || true
rm -rf /var/lib/rancher/k3s/server/db 2>/dev/null || true
SELF_IP=$(hostname -I | awk '{{print $1}}')

for i in $(seq 1 30); do
  if timeout 2 bash -c "echo > /dev/tcp/{seed_ip}/6443" 2>/dev/null \
     && curl -sk https://{seed_ip}:6443/livez >/dev/null 2>&1; then
    break
  fi
  sleep 2
done

{install}
mkdir -p /etc/rancher/k3s
cat > /etc/rancher/k3s/config.yaml <<EOF
server: https://{seed_ip}:6443
token: {token}
cluster-cidr: {cluster_cidr}
service-cidr: {service_cidr}
cluster-dns: {cluster_dns}
node-ip: $SELF_IP
disable:
  - traefik
EOF
systemctl enable --now k3s
for i in $(seq 1 60); do
  systemctl is-active --quiet k3s && break
  sleep 2
done
systemctl is-active --quiet k3s
"#,
        guard = already_installed_guard(),
        install = install_channel(k3s_version),
        seed_ip = seed_private_ip,
        token = token,
        cluster_cidr = CLUSTER_CIDR,
        service_cidr = SERVICE_CIDR,
        cluster_dns = CLUSTER_DNS,
    )
}

/// Worker pool joiner (§4.8.11): a plain K3s agent. Omits `cluster-init`
/// and the control-plane CIDRs — a worker never votes.
pub fn worker_join_script(server_private_ip: &str, token: &str, k3s_version: Option<&str>) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail
{guard}
{install_agent}
mkdir -p /etc/rancher/k3s
cat > /etc/rancher/k3s/config.yaml <<EOF
server: https://{server_ip}:6443
token: {token}
EOF
systemctl enable --now k3s-agent
for i in $(seq 1 60); do
  systemctl is-active --quiet k3s-agent && break
  sleep 2
done
systemctl is-active --quiet k3s-agent
"#,
        guard = already_installed_guard(),
        install_agent = match k3s_version {
            Some(v) => format!(
                "curl -sfL https://get.k3s.io | INSTALL_K3S_VERSION={v} K3S_URL=https://{server_private_ip}:6443 K3S_TOKEN={token} sh -"
            ),
            None => format!(
                "curl -sfL https://get.k3s.io | K3S_URL=https://{server_private_ip}:6443 K3S_TOKEN={token} sh -"
            ),
        },
        server_ip = server_private_ip,
        token = token,
    )
}

/// Generic k3s-binary install for the Installing phase (§4.8.4), used
/// before any mode-specific config is written.
pub fn base_install_script(k3s_version: Option<&str>) -> String {
    format!(
        "#!/bin/bash\nset -euo pipefail\n{guard}\n{install}\n",
        guard = already_installed_guard(),
        install = install_channel(k3s_version),
    )
}

/// Cluster-formation check run on the seed (§4.8.6 step 6): prints node
/// count and ready-node count as two space-separated integers.
pub fn cluster_formation_check_script() -> &'static str {
    r#"total=$(k3s kubectl get nodes --no-headers | wc -l)
ready=$(k3s kubectl get nodes --no-headers | awk '$2 == "Ready"' | wc -l)
echo "$total $ready"
"#
}

pub fn parse_formation_output(output: &str) -> Option<(usize, usize)> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?;
    let mut parts = line.split_whitespace();
    let total: usize = parts.next()?.parse().ok()?;
    let ready: usize = parts.next()?.parse().ok()?;
    Some((total, ready))
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"K10[0-9a-f]*::server:[^\s]+").expect("static token pattern"))
}

pub fn is_valid_token(token: &str) -> bool {
    token.starts_with("K10") && token.contains("::server:")
}

/// Three-tier extraction (§9): markers first, then a regex scan of the raw
/// output, then `None` — the third fallback (a separate read command) is an
/// I/O retry and lives at the call site, not here.
pub fn parse_token(output: &str) -> Option<String> {
    if let (Some(start), Some(end)) = (output.find(TOKEN_START), output.find(TOKEN_END)) {
        let begin = start + TOKEN_START.len();
        if begin <= end {
            let candidate = output[begin..end].trim();
            if is_valid_token(candidate) {
                return Some(candidate.to_string());
            }
        }
    }

    token_regex()
        .find(output)
        .map(|m| m.as_str().to_string())
        .filter(|t| is_valid_token(t))
}
