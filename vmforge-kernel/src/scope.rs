/**
 * SCOPE & CLÉS - Espace de noms du cache dérivé des credentials vCenter
 *
 * RÔLE :
 * Garantit que deux environnements (ou deux comptes) ne partagent jamais
 * d'entrées de cache, même dans un Redis commun.
 *
 * FONCTIONNEMENT :
 * - `ScopeKey` = SHA-256 de (serveur, utilisateur, mot de passe), tronqué à 128 bits
 * - Credentials incomplets => scope "anonymous" (jamais d'erreur)
 * - Mode simulation => scope préfixé "sim-" pour ne pas polluer le scope réel
 * - `KeySpace` construit toutes les clés : {prefix}:{scope}:{type}[:{qualifier}]
 */

use crate::models::ResourceKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write as _};

/// Credentials vCenter. Le mot de passe n'apparaît jamais dans `Debug`.
#[derive(Clone, Default)]
pub struct Credentials {
    pub server: String,
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(
        server: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn is_complete(&self) -> bool {
        !self.server.trim().is_empty()
            && !self.username.trim().is_empty()
            && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub const ANONYMOUS: &'static str = "anonymous";
    const SIMULATION_PREFIX: &'static str = "sim-";

    /// Empreinte one-way des credentials
    pub fn derive(credentials: &Credentials) -> Self {
        if !credentials.is_complete() {
            return Self(Self::ANONYMOUS.to_string());
        }
        let mut hasher = Sha256::new();
        // le nom de serveur n'est pas sensible à la casse, le reste oui
        hasher.update(credentials.server.trim().to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(credentials.username.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(credentials.password.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    /// Scope dédié aux données simulées pour ces credentials
    pub fn simulated(credentials: &Credentials) -> Self {
        let base = Self::derive(credentials);
        Self(format!("{}{}", Self::SIMULATION_PREFIX, base.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == Self::ANONYMOUS
    }

    pub fn is_simulated(&self) -> bool {
        self.0.starts_with(Self::SIMULATION_PREFIX)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contrat `scope_key(server, username, password) -> string`
pub fn scope_key(server: &str, username: &str, password: &str) -> String {
    ScopeKey::derive(&Credentials::new(server, username, password)).0
}

/// Constructeur de clés pour un préfixe + un scope
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
    scope: ScopeKey,
}

impl KeySpace {
    pub const COMPRESSION_MARKER: &'static str = "#z";
    pub const DELTA_SUFFIX: &'static str = "#delta";

    pub fn new(prefix: impl Into<String>, scope: ScopeKey) -> Self {
        Self {
            prefix: prefix.into(),
            scope,
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    /// {prefix}:{scope}:{type}[:{qualifier}]
    pub fn key(&self, kind: ResourceKind, qualifier: Option<&str>) -> String {
        match qualifier {
            Some(q) => {
                format!("{}:{}:{}:{}", self.prefix, self.scope, kind.as_str(), encode_qualifier(q))
            }
            None => format!("{}:{}:{}", self.prefix, self.scope, kind.as_str()),
        }
    }

    pub fn delta_key(&self, kind: ResourceKind, qualifier: Option<&str>) -> String {
        format!("{}{}", self.key(kind, qualifier), Self::DELTA_SUFFIX)
    }

    /// Motif couvrant un type (ou tout le scope), marqueurs et deltas compris
    pub fn pattern(&self, kind: Option<ResourceKind>) -> String {
        match kind {
            Some(kind) => format!("{}:{}:{}*", self.prefix, self.scope, kind.as_str()),
            None => format!("{}:{}:*", self.prefix, self.scope),
        }
    }
}

/// Encodage pourcent réversible : deux qualifiants distincts restent distincts
/// et aucun caractère de motif (`* ? [ ]`) ni séparateur (`:` `#`) ne subsiste
fn encode_qualifier(qualifier: &str) -> String {
    let mut out = String::with_capacity(qualifier.len());
    for byte in qualifier.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                out.push(char::from(byte))
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key_is_deterministic() {
        let a = scope_key("vcenter.lab", "admin", "secret");
        let b = scope_key("VCENTER.lab", "admin", "secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(!a.contains("secret"));
    }

    #[test]
    fn test_distinct_credentials_give_distinct_scopes() {
        let a = scope_key("vcenter.lab", "admin", "secret");
        let b = scope_key("vcenter.lab", "admin", "secret2");
        let c = scope_key("vcenter.prod", "admin", "secret");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_missing_credentials_fall_back_to_anonymous() {
        assert_eq!(scope_key("", "", ""), ScopeKey::ANONYMOUS);
        assert_eq!(scope_key("vcenter.lab", "admin", ""), ScopeKey::ANONYMOUS);
    }

    #[test]
    fn test_simulated_scope_never_collides_with_real_one() {
        let creds = Credentials::new("vcenter.lab", "admin", "secret");
        let real = ScopeKey::derive(&creds);
        let sim = ScopeKey::simulated(&creds);
        assert_ne!(real, sim);
        assert!(sim.is_simulated());
        assert!(ScopeKey::simulated(&Credentials::default()).as_str().starts_with("sim-anonymous"));
    }

    #[test]
    fn test_keyspace_layout() {
        let keys = KeySpace::new("vmforge", ScopeKey("abc".into()));
        assert_eq!(keys.key(ResourceKind::Datacenter, None), "vmforge:abc:datacenters");
        assert_eq!(
            keys.key(ResourceKind::Cluster, Some("DC East:1")),
            "vmforge:abc:clusters:DC%20East%3A1"
        );
        assert_eq!(
            keys.delta_key(ResourceKind::Datastore, Some("domain-c8")),
            "vmforge:abc:datastores:domain-c8#delta"
        );
        assert_eq!(keys.pattern(Some(ResourceKind::Network)), "vmforge:abc:networks*");
        assert_eq!(keys.pattern(None), "vmforge:abc:*");
    }

    #[test]
    fn test_qualifiers_never_collide() {
        let keys = KeySpace::new("vmforge", ScopeKey("abc".into()));
        let key = |q| keys.key(ResourceKind::Cluster, Some(q));
        assert_ne!(key("DC 1"), key("DC_1"));
        assert_ne!(key("DC:1"), key("DC#1"));
        assert_eq!(key("Paris-é"), "vmforge:abc:clusters:Paris-%C3%A9");
        assert!(!key("a*b?[c]").contains(['*', '?', '[', ']']));
    }

    #[test]
    fn test_debug_masks_password() {
        let creds = Credentials::new("vc", "admin", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
