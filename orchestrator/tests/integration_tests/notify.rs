// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application servers and the nodes that depend on them

use crate::common::{count_matching, TestContext, DIRECTORY_CERT};
use gluu_common::api::NodeRole;
use gluu_common::steps::Step;
use gluu_orchestrator::setup::StepError;
use gluu_orchestrator::SetupError;

const PROXY_CONFIG: &str = "/etc/nginx/sites-available/gluu_https.conf";

fn contents(bytes: &Option<Vec<u8>>) -> String {
    String::from_utf8(bytes.clone().unwrap()).unwrap()
}

#[tokio::test]
async fn test_web_front_follows_auth_servers() {
    let cptestctx =
        TestContext::new("test_web_front_follows_auth_servers").await;
    let web = cptestctx.deployed("web-1", NodeRole::WebFront).await;
    let initial = cptestctx.writes_to(PROXY_CONFIG);
    assert_eq!(initial.len(), 1);
    assert!(!contents(&initial[0].contents).contains("oxauth_backend"));

    cptestctx.deployed("ldap-1", NodeRole::Directory).await;
    cptestctx.executor.clear();

    let auth = cptestctx.deployed("auth-1", NodeRole::AuthServer).await;
    assert_eq!(auth.overlay.unwrap().addr.to_string(), "10.20.10.3");

    let web_target = cptestctx.container_target(&web);
    let on_web = cptestctx.commands_on(&web_target);
    assert_eq!(
        on_web,
        vec![
            format!("cat > {PROXY_CONFIG}"),
            format!(
                "ln -sf {PROXY_CONFIG} \
                 /etc/nginx/sites-enabled/gluu_https.conf"
            ),
            "nginx -s reload".to_string(),
        ]
    );
    let refreshed = cptestctx.writes_to(PROXY_CONFIG);
    assert_eq!(refreshed.len(), 1);
    let config = contents(&refreshed[0].contents);
    assert!(config.contains("upstream oxauth_backend"));
    assert!(config.contains("server 10.20.10.3:8443;"));
    assert!(config.contains("server_name ox.example.com;"));

    // The application server reaches the directory over LDAPS.
    let ldap_properties =
        cptestctx.writes_to("/opt/tomcat/conf/ox-ldap.properties");
    assert_eq!(ldap_properties.len(), 1);
    assert!(contents(&ldap_properties[0].contents).contains("10.20.10.2:1636"));

    cptestctx.executor.clear();
    cptestctx.orchestrator.teardown(auth.id).await.unwrap();
    let refreshed = cptestctx.writes_to(PROXY_CONFIG);
    assert_eq!(refreshed.len(), 1);
    assert!(!contents(&refreshed[0].contents).contains("oxauth_backend"));
    assert_eq!(
        count_matching(&cptestctx.commands_on(&web_target), "nginx -s reload"),
        1
    );

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_trust_server_setup() {
    let cptestctx = TestContext::new("test_trust_server_setup").await;
    cptestctx.deployed("web-1", NodeRole::WebFront).await;
    cptestctx.deployed("ldap-1", NodeRole::Directory).await;
    cptestctx.executor.clear();

    let trust = cptestctx.deployed("trust-1", NodeRole::TrustServer).await;
    let on_trust = cptestctx.commands_on(&cptestctx.container_target(&trust));
    assert!(on_trust.iter().any(|c| {
        c == "grep -qxF '10.20.10.1 ox.example.com' /etc/hosts || \
              echo '10.20.10.1 ox.example.com' >> /etc/hosts"
    }));
    assert!(on_trust.iter().any(|c| {
        c.contains("keytool -import -trustcacerts -alias 10.20.10.2_opendj")
    }));

    let certs = cptestctx.writes_to("/etc/certs/10.20.10.2_opendj.crt");
    assert_eq!(certs.len(), 1);
    assert_eq!(contents(&certs[0].contents), DIRECTORY_CERT);

    // Trust servers sit behind the web front as well.
    let refreshed = cptestctx.writes_to(PROXY_CONFIG);
    assert_eq!(refreshed.len(), 1);
    let config = contents(&refreshed[0].contents);
    assert!(config.contains("upstream oxtrust_backend"));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_web_front_reaches_earlier_apps() {
    let cptestctx =
        TestContext::new("test_web_front_reaches_earlier_apps").await;
    cptestctx.deployed("ldap-1", NodeRole::Directory).await;
    let trust = cptestctx.deployed("trust-1", NodeRole::TrustServer).await;
    let idp = cptestctx.deployed("idp-1", NodeRole::FederationProxy).await;
    let apps = [
        cptestctx.container_target(&trust),
        cptestctx.container_target(&idp),
    ];
    for target in &apps {
        let commands = cptestctx.commands_on(target);
        assert_eq!(count_matching(&commands, "/etc/hosts"), 0);
    }
    cptestctx.executor.clear();

    let web = cptestctx.deployed("web-1", NodeRole::WebFront).await;
    assert_eq!(web.overlay.unwrap().addr.to_string(), "10.20.10.4");
    for target in &apps {
        assert_eq!(
            cptestctx.commands_on(target),
            vec![
                "grep -qxF '10.20.10.4 ox.example.com' /etc/hosts || \
                 echo '10.20.10.4 ox.example.com' >> /etc/hosts"
                    .to_string()
            ]
        );
    }
    cptestctx.executor.clear();

    // Applications keep resolving to the first web front.
    cptestctx.deployed("web-2", NodeRole::WebFront).await;
    for target in &apps {
        assert!(cptestctx.commands_on(target).is_empty());
    }

    cptestctx.cleanup_successful();
}

#[tokio::test(start_paused = true)]
async fn test_federation_proxy_trusts_new_directories() {
    let cptestctx =
        TestContext::new("test_federation_proxy_trusts_new_directories").await;
    cptestctx.deployed("ldap-1", NodeRole::Directory).await;
    let proxy = cptestctx.deployed("idp-1", NodeRole::FederationProxy).await;
    assert_eq!(
        cptestctx.writes_to("/etc/certs/10.20.10.1_opendj.crt").len(),
        1
    );
    cptestctx.executor.clear();

    let ldap = cptestctx.deployed("ldap-2", NodeRole::Directory).await;
    assert_eq!(ldap.overlay.unwrap().addr.to_string(), "10.20.10.3");

    // Every deployed directory is trusted again, the new one included.
    let proxy_target = cptestctx.container_target(&proxy);
    let on_proxy = cptestctx.commands_on(&proxy_target);
    assert_eq!(count_matching(&on_proxy, "keytool -import -trustcacerts"), 2);
    let certs = cptestctx.writes_to("/etc/certs/10.20.10.3_opendj.crt");
    assert_eq!(certs.len(), 1);
    assert_eq!(certs[0].target, proxy_target);

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_pending_node_teardown_notifies_nobody() {
    let cptestctx =
        TestContext::new("test_pending_node_teardown_notifies_nobody").await;
    cptestctx.deployed("web-1", NodeRole::WebFront).await;
    cptestctx.executor.clear();

    let auth = cptestctx.add_node("auth-1", NodeRole::AuthServer).await;
    cptestctx.orchestrator.teardown(auth.id).await.unwrap();
    assert!(cptestctx.executor.invocations().is_empty());

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_auth_server_needs_directory() {
    let cptestctx = TestContext::new("test_auth_server_needs_directory").await;
    let auth = cptestctx.add_node("auth-1", NodeRole::AuthServer).await;

    let err = cptestctx.deploy(&auth).await.unwrap_err();
    match err {
        SetupError::Step {
            step: Step::RenderLdapProperties,
            err: StepError::MissingPeer { role, .. },
        } => assert_eq!(role, NodeRole::Directory),
        err => panic!("unexpected error: {err:?}"),
    }

    cptestctx.cleanup_successful();
}
