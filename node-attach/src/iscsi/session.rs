//! iSCSI session management via `iscsiadm`.
//!
//! [`SessionManager::ensure_session`] is idempotent: it checks the active
//! session list first and only runs discovery and login when no session to
//! the portal exists. Login itself is not idempotent at the tool level.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::{ISCSI_ERR_NO_OBJS_FOUND, Inventory};
use crate::config::EngineConfig;
use crate::error::{AttachError, Result};
use crate::exec::{Executor, Invocation};
use crate::types::{ChapCredentials, DiscoveryInfo, Portal, SessionInfo, portal_ip};

/// Initiator name file, relative to the host root.
pub const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

/// Parse `iscsiadm -m session` output.
///
/// ```text
/// tcp: [3] 10.0.207.7:3260,1028 iqn.1992-08.com.example:sn.1 (non-flash)
/// ```
pub fn parse_sessions(output: &str) -> Vec<SessionInfo> {
    let mut sessions = Vec::new();
    for line in output.trim().lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() <= 3 {
            continue;
        }
        let sid = fields[1].trim_start_matches('[').trim_end_matches(']');
        let Ok(sid) = sid.parse::<u32>() else {
            warn!(line, "Could not parse session id");
            continue;
        };
        let info = SessionInfo {
            sid,
            portal: fields[2].to_string(),
            portal_ip: portal_ip(fields[2]),
            target_name: fields[3].to_string(),
        };
        debug!(sid, portal = %info.portal, portal_ip = %info.portal_ip, target = %info.target_name, "Adding iSCSI session info");
        sessions.push(info);
    }
    sessions
}

/// Parse SendTargets discovery output.
///
/// ```text
/// 10.63.152.249:3260,1 iqn.1992-08.com.example:2752
/// [fd20:8b1e:b258:2000::2]:3260,1038 iqn.1992-08.com.example:sn.789
/// ```
pub fn parse_discovery(output: &str) -> Vec<DiscoveryInfo> {
    let mut targets = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        let info = DiscoveryInfo {
            portal: fields[0].to_string(),
            portal_ip: portal_ip(fields[0]),
            target_name: fields[1].to_string(),
        };
        debug!(portal = %info.portal, portal_ip = %info.portal_ip, target = %info.target_name, "Adding iSCSI discovery info");
        targets.push(info);
    }
    targets
}

/// Establishes and tears down iSCSI sessions.
#[derive(Debug, Clone)]
pub struct SessionManager {
    exec: Executor,
    config: Arc<EngineConfig>,
    inventory: Inventory,
}

impl SessionManager {
    pub fn new(exec: Executor, config: Arc<EngineConfig>, inventory: Inventory) -> Self {
        Self {
            exec,
            config,
            inventory,
        }
    }

    async fn iscsiadm(&self, args: &[&str]) -> Result<Vec<u8>> {
        Ok(self.exec.exec("iscsiadm", args).await?)
    }

    /// True when `iscsiadm` runs on this host.
    pub async fn supported(&self) -> bool {
        match self.iscsiadm(&["-V"]).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "iscsiadm tools not found on this host");
                false
            }
        }
    }

    /// Active sessions; "no objects found" is an empty list.
    pub async fn sessions(&self) -> Result<Vec<SessionInfo>> {
        match self.exec.exec("iscsiadm", &["-m", "session"]).await {
            Ok(out) => Ok(parse_sessions(&String::from_utf8_lossy(&out))),
            Err(e) if e.exit_code() == Some(ISCSI_ERR_NO_OBJS_FOUND) => {
                debug!("No iSCSI session found");
                Ok(Vec::new())
            }
            Err(e) => {
                error!(error = %e, "Problem checking iSCSI sessions");
                Err(e.into())
            }
        }
    }

    /// A session exists whose portal IP equals `ip_literal` (IPv6 bracketed).
    pub async fn session_exists(&self, ip_literal: &str) -> Result<bool> {
        Ok(self
            .sessions()
            .await?
            .iter()
            .any(|s| s.portal_ip == ip_literal))
    }

    /// A session exists to `target_iqn` on any portal.
    pub async fn session_exists_to_target(&self, target_iqn: &str) -> Result<bool> {
        Ok(self
            .sessions()
            .await?
            .iter()
            .any(|s| s.target_name == target_iqn))
    }

    pub async fn discover(&self, portal: &Portal) -> Result<Vec<DiscoveryInfo>> {
        let portal = portal.to_portal_string();
        let out = self
            .iscsiadm(&["-m", "discovery", "-t", "sendtargets", "-p", &portal])
            .await?;
        Ok(parse_discovery(&String::from_utf8_lossy(&out)))
    }

    /// Set one node record parameter.
    pub async fn configure_node(
        &self,
        target_iqn: &str,
        portal: &Portal,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let portal = portal.to_portal_string();
        self.iscsiadm(&[
            "-m", "node", "-T", target_iqn, "-p", &portal, "-o", "update", "-n", name, "-v", value,
        ])
        .await
        .inspect_err(|e| warn!(target_iqn, portal = %portal, name, error = %e, "Error configuring iSCSI target"))?;
        Ok(())
    }

    pub async fn login(&self, target_iqn: &str, portal: &Portal) -> Result<()> {
        let portal = portal.to_portal_string();
        self.inventory.log_snapshot("before login").await;
        self.iscsiadm(&["-m", "node", "-T", target_iqn, "-l", "-p", &portal])
            .await
            .inspect_err(|e| error!(target_iqn, portal = %portal, error = %e, "Error logging in to iSCSI target"))?;
        self.inventory.log_snapshot("after login").await;
        Ok(())
    }

    /// Make sure a session to `portal` exists, logging in to every portal
    /// of the matching target so multipath sees all paths.
    #[instrument(skip(self))]
    pub async fn ensure_session(&self, portal: &str) -> Result<()> {
        if !self.supported().await {
            return Err(AttachError::Session(
                "iSCSI support not detected".to_string(),
            ));
        }

        let portal = Portal::parse(portal, self.config.iscsi_port)
            .map_err(|e| AttachError::InvalidArgument(e.to_string()))?;
        let ip = portal.ip_literal();

        let exists = self.session_exists(&ip).await.map_err(|e| {
            AttachError::Session(format!("could not check for iSCSI session: {e}"))
        })?;
        if exists {
            debug!(portal = %ip, "Found session to iSCSI portal");
            return Ok(());
        }

        let targets = self
            .discover(&portal)
            .await
            .map_err(|e| AttachError::Session(format!("could not run iSCSI discovery: {e}")))?;
        if targets.is_empty() {
            return Err(AttachError::Session(
                "iSCSI discovery found no targets".to_string(),
            ));
        }
        debug!(targets = ?targets, "Found matching iSCSI targets");

        let Some(target_name) = targets
            .iter()
            .find(|t| t.portal_ip == ip)
            .map(|t| t.target_name.clone())
        else {
            return Err(AttachError::Session(format!(
                "iSCSI discovery found no targets with portal {ip}"
            )));
        };

        for target in targets.iter().filter(|t| t.target_name == target_name) {
            let login_portal = Portal::parse(&target.portal, self.config.iscsi_port)
                .map_err(|e| AttachError::Parse {
                    what: "discovered portal",
                    detail: e.to_string(),
                })?;

            // older initiator tools reject this parameter
            if let Err(e) = self
                .configure_node(&target_name, &login_portal, "node.session.scan", "manual")
                .await
            {
                debug!(error = %e, "Ignoring scan mode configuration failure");
            }

            self.configure_node(
                &target_name,
                &login_portal,
                "node.session.timeo.replacement_timeout",
                "5",
            )
            .await
            .map_err(|e| AttachError::Session(format!("set replacement timeout failed: {e}")))?;

            self.login(&target_name, &login_portal)
                .await
                .map_err(|e| AttachError::Session(format!("login to iSCSI target failed: {e}")))?;
        }

        let exists = self.session_exists(&ip).await.map_err(|e| {
            AttachError::Session(format!("could not recheck for iSCSI session: {e}"))
        })?;
        if !exists {
            return Err(AttachError::Session(format!(
                "expected iSCSI session {ip} NOT found, please login to the iSCSI portal"
            )));
        }

        info!(portal = %ip, "iSCSI session established");
        Ok(())
    }

    /// [`ensure_session`](Self::ensure_session) for each portal in turn.
    pub async fn ensure_sessions<'a>(
        &self,
        portals: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        for portal in portals {
            self.ensure_session(portal).await?;
        }
        Ok(())
    }

    /// Create a CHAP-authenticated node record for `portal` and log in.
    #[instrument(skip(self, creds), fields(user = %creds.user))]
    pub async fn login_with_chap(
        &self,
        target_iqn: &str,
        portal: &Portal,
        creds: &ChapCredentials,
        iface: &str,
    ) -> Result<()> {
        let portal = portal.to_portal_string();
        let base = ["-m", "node", "-T", target_iqn, "-p", portal.as_str()];

        let run = |extra: &[&str], secret: bool, step: &'static str| {
            let mut args: Vec<&str> = base.to_vec();
            args.extend_from_slice(extra);
            let mut invocation = Invocation::new("iscsiadm", args);
            if secret && !self.config.log_sensitive {
                invocation = invocation.sensitive();
            }
            async move {
                self.exec.run(invocation).await.map_err(|e| {
                    error!(step, error = %e, "Error running iscsiadm");
                    AttachError::Session(format!("iscsiadm {step} failed: {e}"))
                })
            }
        };

        self.inventory.log_snapshot("before CHAP login").await;

        run(&["--interface", iface, "--op", "new"], false, "node create").await?;
        run(
            &["--op=update", "--name", "node.session.auth.authmethod", "--value=CHAP"],
            false,
            "set authmethod",
        )
        .await?;

        let user = format!("--value={}", creds.user);
        run(
            &["--op=update", "--name", "node.session.auth.username", &user],
            false,
            "set authuser",
        )
        .await?;

        let password = format!("--value={}", creds.secret);
        run(
            &["--op=update", "--name", "node.session.auth.password", &password],
            true,
            "set authpassword",
        )
        .await?;

        if let (Some(mutual_user), Some(mutual_secret)) = (&creds.mutual_user, &creds.mutual_secret)
            && !mutual_user.is_empty()
            && !mutual_secret.is_empty()
        {
            let user_in = format!("--value={mutual_user}");
            run(
                &["--op=update", "--name", "node.session.auth.username_in", &user_in],
                false,
                "set authuser_in",
            )
            .await?;

            let password_in = format!("--value={mutual_secret}");
            run(
                &["--op=update", "--name", "node.session.auth.password_in", &password_in],
                true,
                "set authpassword_in",
            )
            .await?;
        }

        run(&["--login"], false, "login").await?;
        self.inventory.log_snapshot("after CHAP login").await;
        Ok(())
    }

    /// Log out of `portal` and delete the target's node records.
    ///
    /// A failed logout is only logged; the node delete result is returned.
    #[instrument(skip(self))]
    pub async fn logout_and_delete(&self, target_iqn: &str, portal: &str) -> Result<()> {
        self.inventory.log_snapshot("before logout").await;
        if let Err(e) = self
            .iscsiadm(&["-m", "node", "-T", target_iqn, "--portal", portal, "-u"])
            .await
        {
            debug!(error = %e, "Error during iSCSI logout");
        }

        let result = self
            .iscsiadm(&["-m", "node", "-o", "delete", "-T", target_iqn])
            .await
            .map(|_| ());
        self.inventory.log_snapshot("after logout").await;
        result
    }

    /// Initiator names configured on this host.
    pub async fn initiator_iqns(&self) -> Result<Vec<String>> {
        let path = self.config.host_path(INITIATOR_NAME_FILE);
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            warn!(error = %e, "Could not read initiatorname.iscsi; perhaps iSCSI is not installed?");
            AttachError::io(format!("reading {}", path.display()), e)
        })?;

        Ok(contents
            .lines()
            .filter(|l| l.contains("InitiatorName="))
            .filter_map(|l| l.split('=').nth(1))
            .map(|iqn| iqn.trim().to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::Sysfs;
    use crate::testing::{HostTree, Reply, ScriptedRunner};

    const IQN: &str = "iqn.1992-08.com.example:sn.abc:vs.3";

    fn manager(runner: Arc<ScriptedRunner>) -> SessionManager {
        let exec = Executor::new(runner);
        let inventory = Inventory::new(exec.clone(), Sysfs::default());
        SessionManager::new(exec, Arc::new(EngineConfig::default()), inventory)
    }

    #[test]
    fn test_parse_sessions() {
        let out = "tcp: [3] 10.0.207.7:3260,1028 iqn.a (non-flash)\n\
                   tcp: [4] [fd20::9]:3260,1029 iqn.b (non-flash)\n\
                   garbage\n";
        let sessions = parse_sessions(out);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].sid, 3);
        assert_eq!(sessions[0].portal_ip, "10.0.207.7");
        assert_eq!(sessions[0].target_name, "iqn.a");
        assert_eq!(sessions[1].portal_ip, "[fd20::9]");
        assert_eq!(sessions[1].portal, "[fd20::9]:3260,1029");
    }

    #[test]
    fn test_parse_discovery_ipv4_and_ipv6() {
        let out = "[fd20:8b1e::2]:3260,1038 iqn.foo\n10.0.0.5:3260,1 iqn.bar\n\n";
        let targets = parse_discovery(out);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].portal_ip, "[fd20:8b1e::2]");
        assert_eq!(targets[0].target_name, "iqn.foo");
        assert_eq!(targets[1].portal_ip, "10.0.0.5");
        assert_eq!(targets[1].target_name, "iqn.bar");
    }

    #[tokio::test]
    async fn test_sessions_no_objects_is_empty() {
        let runner = ScriptedRunner::new().on(
            "iscsiadm",
            &["-m", "session"],
            Reply::exit(21, "iscsiadm: No active sessions."),
        );
        let sessions = manager(runner).sessions().await.unwrap();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_sessions_other_error_propagates() {
        let runner =
            ScriptedRunner::new().on("iscsiadm", &["-m", "session"], Reply::exit(4, "boom"));
        assert!(manager(runner).sessions().await.is_err());
    }

    #[tokio::test]
    async fn test_ensure_session_existing_is_noop() {
        let runner = ScriptedRunner::new().on(
            "iscsiadm",
            &["-m", "session"],
            Reply::ok(&format!("tcp: [1] 10.0.0.5:3260,1 {IQN} (non-flash)\n")),
        );
        manager(runner.clone())
            .ensure_session("10.0.0.5")
            .await
            .unwrap();
        assert_eq!(runner.count("iscsiadm", &["discovery"]), 0);
        assert_eq!(runner.count("iscsiadm", &["-l"]), 0);
    }

    #[tokio::test]
    async fn test_ensure_session_exact_ip_match() {
        // 10.0.0.50 must not satisfy a request for 10.0.0.5
        let runner = ScriptedRunner::new()
            .once(
                "iscsiadm",
                &["-m", "session"],
                Reply::ok(&format!("tcp: [1] 10.0.0.50:3260,1 {IQN} (non-flash)\n")),
            )
            .on(
                "iscsiadm",
                &["discovery"],
                Reply::ok(&format!("10.0.0.5:3260,1 {IQN}\n")),
            )
            .on(
                "iscsiadm",
                &["-m", "session"],
                Reply::ok(&format!(
                    "tcp: [1] 10.0.0.50:3260,1 {IQN} (non-flash)\ntcp: [2] 10.0.0.5:3260,1 {IQN} (non-flash)\n"
                )),
            );
        manager(runner.clone())
            .ensure_session("10.0.0.5")
            .await
            .unwrap();
        assert_eq!(runner.count("iscsiadm", &["-l", "-p", "10.0.0.5:3260"]), 1);
    }

    #[tokio::test]
    async fn test_ensure_session_logs_in_to_every_portal_of_target() {
        let discovery = format!(
            "10.0.0.5:3260,1 {IQN}\n10.0.0.6:3260,2 {IQN}\n10.0.0.7:3260,3 iqn.other\n"
        );
        let runner = ScriptedRunner::new()
            .once("iscsiadm", &["-m", "session"], Reply::exit(21, ""))
            .on("iscsiadm", &["discovery", "-p", "10.0.0.5:3260"], Reply::ok(&discovery))
            .on(
                "iscsiadm",
                &["-m", "session"],
                Reply::ok(&format!("tcp: [1] 10.0.0.5:3260,1 {IQN} (non-flash)\n")),
            );

        manager(runner.clone())
            .ensure_session("10.0.0.5")
            .await
            .unwrap();

        assert_eq!(runner.count("iscsiadm", &["-l"]), 2);
        assert_eq!(runner.count("iscsiadm", &["-l", "-p", "10.0.0.6:3260"]), 1);
        assert_eq!(runner.count("iscsiadm", &["iqn.other"]), 0);
        assert_eq!(
            runner.count("iscsiadm", &["-n", "node.session.scan", "-v", "manual"]),
            2
        );
        assert_eq!(
            runner.count(
                "iscsiadm",
                &["-n", "node.session.timeo.replacement_timeout", "-v", "5"]
            ),
            2
        );
    }

    #[tokio::test]
    async fn test_ensure_session_scan_mode_failure_is_swallowed() {
        let runner = ScriptedRunner::new()
            .once("iscsiadm", &["-m", "session"], Reply::exit(21, ""))
            .on("iscsiadm", &["discovery"], Reply::ok(&format!("10.0.0.5:3260,1 {IQN}\n")))
            .on("iscsiadm", &["node.session.scan"], Reply::exit(7, "unknown parameter"))
            .on(
                "iscsiadm",
                &["-m", "session"],
                Reply::ok(&format!("tcp: [1] 10.0.0.5:3260,1 {IQN} (non-flash)\n")),
            );
        manager(runner.clone())
            .ensure_session("10.0.0.5")
            .await
            .unwrap();
        assert_eq!(runner.count("iscsiadm", &["-l"]), 1);
    }

    #[tokio::test]
    async fn test_ensure_session_replacement_timeout_failure_is_fatal() {
        let runner = ScriptedRunner::new()
            .on("iscsiadm", &["-m", "session"], Reply::exit(21, ""))
            .on("iscsiadm", &["discovery"], Reply::ok(&format!("10.0.0.5:3260,1 {IQN}\n")))
            .on(
                "iscsiadm",
                &["node.session.timeo.replacement_timeout"],
                Reply::exit(7, "nope"),
            );
        let err = manager(runner.clone())
            .ensure_session("10.0.0.5")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("replacement timeout"));
        assert_eq!(runner.count("iscsiadm", &["-l"]), 0);
    }

    #[tokio::test]
    async fn test_ensure_session_fails_when_session_missing_after_login() {
        let runner = ScriptedRunner::new()
            .on("iscsiadm", &["-m", "session"], Reply::exit(21, ""))
            .on("iscsiadm", &["discovery"], Reply::ok(&format!("10.0.0.5:3260,1 {IQN}\n")));
        let err = manager(runner)
            .ensure_session("10.0.0.5")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NOT found"));
    }

    #[tokio::test]
    async fn test_ensure_session_no_matching_portal() {
        let runner = ScriptedRunner::new()
            .on("iscsiadm", &["-m", "session"], Reply::exit(21, ""))
            .on("iscsiadm", &["discovery"], Reply::ok(&format!("10.0.0.9:3260,1 {IQN}\n")));
        let err = manager(runner)
            .ensure_session("10.0.0.5")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no targets with portal 10.0.0.5"));
    }

    #[tokio::test]
    async fn test_ensure_session_ipv6_portal() {
        let runner = ScriptedRunner::new()
            .once("iscsiadm", &["-m", "session"], Reply::exit(21, ""))
            .on(
                "iscsiadm",
                &["discovery", "-p", "[fd20:8b1e::2]:3260"],
                Reply::ok(&format!("[fd20:8b1e::2]:3260,1038 {IQN}\n")),
            )
            .on(
                "iscsiadm",
                &["-m", "session"],
                Reply::ok(&format!("tcp: [7] [fd20:8b1e::2]:3260,1038 {IQN} (non-flash)\n")),
            );
        manager(runner.clone())
            .ensure_session("[fd20:8b1e::2]:3260")
            .await
            .unwrap();
        assert_eq!(
            runner.count("iscsiadm", &["-l", "-p", "[fd20:8b1e::2]:3260"]),
            1
        );
    }

    #[tokio::test]
    async fn test_ensure_session_unsupported() {
        let runner = ScriptedRunner::new().on("iscsiadm", &["-V"], Reply::exit(127, ""));
        let err = manager(runner)
            .ensure_session("10.0.0.5")
            .await
            .unwrap_err();
        assert!(matches!(err, AttachError::Session(_)));
    }

    #[tokio::test]
    async fn test_login_with_chap_sequence() {
        let runner = ScriptedRunner::new();
        let creds = ChapCredentials {
            user: "user".into(),
            secret: "secret".into(),
            mutual_user: Some("tuser".into()),
            mutual_secret: Some("tsecret".into()),
        };
        manager(runner.clone())
            .login_with_chap(IQN, &Portal::new("10.0.0.5", 3260), &creds, "default")
            .await
            .unwrap();

        let calls: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|c| c.args.iter().any(|a| a == IQN))
            .collect();
        assert_eq!(calls.len(), 7);
        assert!(calls[0].args.ends_with(&[
            "--interface".to_string(),
            "default".to_string(),
            "--op".to_string(),
            "new".to_string()
        ]));
        assert!(calls.iter().all(|c| c.args[5] == "10.0.0.5:3260"));
        assert_eq!(calls[6].args.last().unwrap(), "--login");

        let password_call = calls
            .iter()
            .find(|c| c.args.iter().any(|a| a == "node.session.auth.password"))
            .unwrap();
        assert!(password_call.sensitive);
        assert!(!password_call.command_line().contains("secret"));
    }

    #[tokio::test]
    async fn test_login_with_chap_one_way_skips_mutual() {
        let runner = ScriptedRunner::new();
        manager(runner.clone())
            .login_with_chap(
                IQN,
                &Portal::new("10.0.0.5", 3260),
                &ChapCredentials::new("u", "p"),
                "default",
            )
            .await
            .unwrap();
        assert_eq!(runner.count("iscsiadm", &["node.session.auth.username_in"]), 0);
        assert_eq!(runner.count("iscsiadm", &["--login"]), 1);
    }

    #[tokio::test]
    async fn test_login_with_chap_aborts_on_config_failure() {
        let runner = ScriptedRunner::new().on(
            "iscsiadm",
            &["node.session.auth.username"],
            Reply::exit(1, "bad"),
        );
        let err = manager(runner.clone())
            .login_with_chap(
                IQN,
                &Portal::new("10.0.0.5", 3260),
                &ChapCredentials::new("u", "p"),
                "default",
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("set authuser"));
        assert_eq!(runner.count("iscsiadm", &["--login"]), 0);
    }

    #[tokio::test]
    async fn test_logout_error_is_only_logged() {
        let runner = ScriptedRunner::new().on("iscsiadm", &["-u"], Reply::exit(21, "no session"));
        manager(runner.clone())
            .logout_and_delete(IQN, "10.0.0.5:3260")
            .await
            .unwrap();
        assert_eq!(runner.count("iscsiadm", &["-o", "delete", "-T", IQN]), 1);
    }

    #[tokio::test]
    async fn test_initiator_iqns() {
        let tree = HostTree::new();
        tree.write(
            "etc/iscsi/initiatorname.iscsi",
            "## DO NOT EDIT\nInitiatorName=iqn.1993-08.org.debian:01:abc\n",
        );
        let exec = Executor::new(ScriptedRunner::new());
        let config = EngineConfig {
            host_root: tree.root().to_path_buf(),
            ..Default::default()
        };
        let inventory = Inventory::new(exec.clone(), Sysfs::from_config(&config));
        let manager = SessionManager::new(exec, Arc::new(config), inventory);

        assert_eq!(
            manager.initiator_iqns().await.unwrap(),
            vec!["iqn.1993-08.org.debian:01:abc"]
        );
    }
}
