// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layout and ports of the directory server inside its container

use camino::Utf8Path;

pub const LDAP_PORT: u16 = 1389;
pub const LDAPS_PORT: u16 = 1636;
pub const JMX_PORT: u16 = 1689;
pub const ADMIN_PORT: u16 = 4444;
pub const REPLICATION_PORT: u16 = 8989;

pub const BIND_DN: &str = "cn=directory manager";
pub const ADMIN_UID: &str = "admin";

pub const BASE_DIR: &str = "/opt/opendj";
pub const SCHEMA_DIR: &str = "/opt/opendj/config/schema";
pub const LDIF_DIR: &str = "/opt/opendj/ldif";
pub const INDEX_JSON: &str = "/opt/opendj/opendj_index.json";
pub const SETUP_PROPERTIES: &str = "/opt/opendj/opendj-setup.properties";
pub const SETUP: &str = "/opt/opendj/setup";
pub const DSCONFIG: &str = "/opt/opendj/bin/dsconfig";
pub const DSJAVAPROPERTIES: &str = "/opt/opendj/bin/dsjavaproperties";
pub const DSREPLICATION: &str = "/opt/opendj/bin/dsreplication";
pub const IMPORT_LDIF: &str = "/opt/opendj/bin/import-ldif";
pub const KEYSTORE_PIN: &str = "/opt/opendj/config/keystore.pin";
pub const TRUSTSTORE: &str = "/opt/opendj/config/truststore";

/// Prints a fresh OpenID Connect JSON web key set.
pub const OPENID_KEYGEN: &str = "java -cp /opt/gluu/lib/bcprov-jdk16-1.46.jar:\
/opt/gluu/lib/jettison-1.3.jar:/opt/gluu/lib/commons-lang-2.6.jar:\
/opt/gluu/lib/log4j-1.2.17.jar:/opt/gluu/lib/commons-codec-1.5.jar:\
/opt/gluu/lib/oxauth-model-2.4.3.Final.jar:\
/opt/gluu/lib/oxauth-server-2.4.3.Final.jar \
org.xdi.oxauth.util.KeyGenerator";

/// Exported server certificate.
pub const CERT_FILE: &str = "/etc/certs/opendj.crt";

/// Java trust store of the application containers.
pub const JAVA_TRUSTSTORE: &str =
    "/usr/lib/jvm/default-java/jre/lib/security/cacerts";

/// Holds the admin password while a directory tool needs it.
pub fn password_file() -> &'static Utf8Path {
    Utf8Path::new("/home/ldap/.pw")
}
