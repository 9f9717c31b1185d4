//! SASL authentication settings for producer connections

use crate::error::{Error, Result};
use crate::oauth::{AuthStyle, ClientCredentials, RefreshingToken, StaticToken, TokenProvider};
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// SASL handshake v0 (raw SASL frames after the handshake)
pub const SASL_HANDSHAKE_V0: i16 = 0;
/// SASL handshake v1 (frames wrapped in SaslAuthenticate requests)
pub const SASL_HANDSHAKE_V1: i16 = 1;

/// Broker protocol release, compared component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KafkaVersion([u32; 3]);

impl KafkaVersion {
    /// 0.10.0
    pub const V0_10_0: KafkaVersion = KafkaVersion([0, 10, 0]);
    /// 1.0.0, the first release with SaslAuthenticate
    pub const V1_0_0: KafkaVersion = KafkaVersion([1, 0, 0]);
    /// 2.1.0
    pub const V2_1_0: KafkaVersion = KafkaVersion([2, 1, 0]);
    /// Version assumed when none is configured
    pub const DEFAULT: KafkaVersion = KafkaVersion::V2_1_0;

    /// Build a version from its components
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        KafkaVersion([major, minor, patch])
    }

    /// Whether `self` is the same as or newer than `other`
    pub fn is_at_least(&self, other: KafkaVersion) -> bool {
        *self >= other
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

impl FromStr for KafkaVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = [0u32; 3];
        let mut count = 0;
        for (i, part) in s.split('.').enumerate() {
            if i >= 3 {
                break;
            }
            parts[i] = part
                .parse()
                .map_err(|_| Error::config(format!("invalid kafka version {:?}", s)))?;
            count += 1;
        }
        if count < 2 {
            return Err(Error::config(format!("invalid kafka version {:?}", s)));
        }
        Ok(KafkaVersion(parts))
    }
}

/// Pick the SASL handshake version for a broker release, honouring an
/// explicit `0` or `1` override.
pub fn sasl_version(kafka_version: KafkaVersion, sasl_version: Option<i32>) -> Result<i16> {
    match sasl_version {
        None if kafka_version.is_at_least(KafkaVersion::V1_0_0) => Ok(SASL_HANDSHAKE_V1),
        None => Ok(SASL_HANDSHAKE_V0),
        Some(0) => Ok(SASL_HANDSHAKE_V0),
        Some(1) => Ok(SASL_HANDSHAKE_V1),
        Some(_) => Err(Error::config("invalid SASL version")),
    }
}

/// Supported SASL mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    /// PLAIN
    Plain,
    /// SCRAM-SHA-256
    ScramSha256,
    /// SCRAM-SHA-512
    ScramSha512,
    /// GSSAPI (Kerberos)
    Gssapi,
    /// OAUTHBEARER
    OAuthBearer,
}

impl SaslMechanism {
    /// Name as used in configuration and by librdkafka
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
            SaslMechanism::Gssapi => "GSSAPI",
            SaslMechanism::OAuthBearer => "OAUTHBEARER",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PLAIN" => Ok(SaslMechanism::Plain),
            "SCRAM-SHA-256" => Ok(SaslMechanism::ScramSha256),
            "SCRAM-SHA-512" => Ok(SaslMechanism::ScramSha512),
            "GSSAPI" => Ok(SaslMechanism::Gssapi),
            "OAUTHBEARER" => Ok(SaslMechanism::OAuthBearer),
            _ => Err(Error::config("invalid sasl-mechanism")),
        }
    }
}

/// Where OAUTHBEARER tokens come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthService {
    /// Any client-credentials endpoint given by `sasl-oauth-token-url`
    Custom,
    /// Auth0, credentials sent as form parameters
    Auth0,
    /// Azure AD, endpoint derived from the tenant
    AzureAd,
}

impl FromStr for OAuthService {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "custom" => Ok(OAuthService::Custom),
            "auth0" => Ok(OAuthService::Auth0),
            "azuread" => Ok(OAuthService::AzureAd),
            _ => Err(Error::config(format!("service {} not supported", s))),
        }
    }
}

/// SASL settings of a cluster. Flattened into the cluster block, so every key
/// carries the `sasl-` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SaslAuth {
    pub sasl_username: String,
    pub sasl_password: String,
    pub sasl_mechanism: String,
    pub sasl_version: Option<i32>,

    // GSSAPI
    pub sasl_gssapi_service_name: String,
    pub sasl_gssapi_auth_type: String,
    pub sasl_gssapi_kerberos_config_path: String,
    pub sasl_gssapi_key_tab_path: String,
    pub sasl_gssapi_realm: String,

    // OAUTHBEARER: service is empty/custom, auth0 or azuread
    pub sasl_oauth_service: String,
    pub sasl_oauth_client_id: String,
    pub sasl_oauth_client_secret: String,
    pub sasl_oauth_token_url: String,
    pub sasl_oauth_scopes: Vec<String>,
    pub sasl_oauth_parameters: BTreeMap<String, String>,
    #[serde(with = "humantime_serde")]
    pub sasl_oauth_token_expiry_margin: Duration,
    /// Static token, replaces the client-credentials flow when set
    pub sasl_access_token: String,
    pub sasl_oauth_tenant_id: String,
}

impl SaslAuth {
    /// Whether the connection authenticates at all
    pub fn enabled(&self) -> bool {
        !self.sasl_username.is_empty() || !self.sasl_mechanism.is_empty()
    }

    /// Parsed mechanism, `None` when unset
    pub fn mechanism(&self) -> Result<Option<SaslMechanism>> {
        if self.sasl_mechanism.is_empty() {
            return Ok(None);
        }
        self.sasl_mechanism.parse().map(Some)
    }

    /// Check the settings without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.mechanism()? != Some(SaslMechanism::OAuthBearer) {
            return Ok(());
        }

        if !self.sasl_access_token.is_empty()
            && (!self.sasl_oauth_service.is_empty() || !self.sasl_oauth_token_url.is_empty())
        {
            return Err(Error::config(
                "cannot set 'sasl-access-token' with 'sasl-oauth-service' and 'sasl-oauth-token-url'",
            ));
        }
        if self.sasl_oauth_client_id.is_empty() || self.sasl_oauth_client_secret.is_empty() {
            return Err(Error::config(
                "'sasl-oauth-client-id' and 'sasl-oauth-client-secret' are required",
            ));
        }
        if !self.sasl_access_token.is_empty() {
            return Ok(());
        }

        match self.sasl_oauth_service.parse::<OAuthService>()? {
            OAuthService::Custom => {
                if self.sasl_oauth_token_url.is_empty() {
                    return Err(Error::config(
                        "'sasl-oauth-token-url' required for custom service",
                    ));
                }
            }
            OAuthService::Auth0 => {
                if self.sasl_oauth_token_url.is_empty() {
                    return Err(Error::config("'sasl-oauth-token-url' required for Auth0"));
                }
                if self
                    .sasl_oauth_parameters
                    .get("audience")
                    .map_or(true, |audience| audience.is_empty())
                {
                    return Err(Error::config("'audience' parameter is required for Auth0"));
                }
            }
            OAuthService::AzureAd => {
                if self.sasl_oauth_tenant_id.is_empty() {
                    return Err(Error::config("'sasl-oauth-tenant-id' required for AzureAD"));
                }
                if !self.sasl_oauth_token_url.is_empty() {
                    return Err(Error::config(format!(
                        "'sasl-oauth-token-url' cannot be set for service {}",
                        self.sasl_oauth_service
                    )));
                }
            }
        }
        Ok(())
    }

    /// Write the SASL properties into `config`. OAUTHBEARER producers also
    /// need the provider from [`SaslAuth::token_provider`] on their context.
    pub fn set_sasl_config(&self, config: &mut ClientConfig, kafka_version: KafkaVersion) -> Result<()> {
        if !self.sasl_username.is_empty() {
            config.set("sasl.username", &self.sasl_username);
        }
        if !self.sasl_password.is_empty() {
            config.set("sasl.password", &self.sasl_password);
        }

        match self.mechanism()? {
            // librdkafka would default to GSSAPI
            None if self.enabled() => {
                config.set("sasl.mechanism", SaslMechanism::Plain.as_str());
            }
            None => {}
            Some(mechanism) => {
                config.set("sasl.mechanism", mechanism.as_str());
                match mechanism {
                    SaslMechanism::Gssapi => self.set_gssapi_config(config),
                    _ => {}
                }
            }
        }

        if self.enabled() {
            let fallback = match sasl_version(kafka_version, self.sasl_version)? {
                SASL_HANDSHAKE_V1 => KafkaVersion::V1_0_0,
                _ => KafkaVersion::V0_10_0,
            };
            config.set("broker.version.fallback", fallback.to_string());
        }
        Ok(())
    }

    fn set_gssapi_config(&self, config: &mut ClientConfig) {
        if !self.sasl_gssapi_service_name.is_empty() {
            config.set("sasl.kerberos.service.name", &self.sasl_gssapi_service_name);
        }
        if !self.sasl_username.is_empty() {
            let principal = if self.sasl_gssapi_realm.is_empty() {
                self.sasl_username.clone()
            } else {
                format!("{}@{}", self.sasl_username, self.sasl_gssapi_realm)
            };
            config.set("sasl.kerberos.principal", principal);
        }
        // KRB5_USER_AUTH relies on the ticket cache
        if self.sasl_gssapi_auth_type == "KRB5_KEYTAB_AUTH" && !self.sasl_gssapi_key_tab_path.is_empty()
        {
            config.set("sasl.kerberos.keytab", &self.sasl_gssapi_key_tab_path);
        }
        if !self.sasl_gssapi_kerberos_config_path.is_empty() {
            config.set(
                "sasl.kerberos.kinit.cmd",
                format!(
                    "KRB5_CONFIG={} kinit -R -t \"%{{sasl.kerberos.keytab}}\" -k %{{sasl.kerberos.principal}} || \
                     KRB5_CONFIG={} kinit -t \"%{{sasl.kerberos.keytab}}\" -k %{{sasl.kerberos.principal}}",
                    self.sasl_gssapi_kerberos_config_path, self.sasl_gssapi_kerberos_config_path
                ),
            );
        }
    }

    /// Token provider for OAUTHBEARER, `None` for every other mechanism.
    /// One provider is meant to be shared by all producers of a cluster.
    pub fn token_provider(&self, timeout: Duration) -> Result<Option<Arc<dyn TokenProvider>>> {
        if self.mechanism()? != Some(SaslMechanism::OAuthBearer) {
            return Ok(None);
        }
        if !self.sasl_access_token.is_empty() {
            return Ok(Some(Arc::new(StaticToken::new(self.sasl_access_token.clone()))));
        }

        let (token_url, style) = match self.sasl_oauth_service.parse::<OAuthService>()? {
            OAuthService::Custom => (self.sasl_oauth_token_url.clone(), AuthStyle::AutoDetect),
            OAuthService::Auth0 => (self.sasl_oauth_token_url.clone(), AuthStyle::InParams),
            OAuthService::AzureAd => (
                ClientCredentials::azure_ad_token_url(&self.sasl_oauth_tenant_id),
                AuthStyle::InParams,
            ),
        };
        let source = ClientCredentials::new(
            self.sasl_oauth_client_id.clone(),
            self.sasl_oauth_client_secret.clone(),
            token_url,
            style,
            timeout,
        )?
        .with_scopes(self.sasl_oauth_scopes.clone())
        .with_params(self.sasl_oauth_parameters.clone());

        Ok(Some(Arc::new(RefreshingToken::new(
            Arc::new(source),
            self.sasl_oauth_token_expiry_margin,
            timeout,
        )?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn oauth(service: &str, token_url: &str) -> SaslAuth {
        SaslAuth {
            sasl_mechanism: "OAUTHBEARER".into(),
            sasl_oauth_client_id: "id".into(),
            sasl_oauth_client_secret: "secret".into(),
            sasl_oauth_service: service.into(),
            sasl_oauth_token_url: token_url.into(),
            ..Default::default()
        }
    }

    fn with_audience(mut auth: SaslAuth) -> SaslAuth {
        auth.sasl_oauth_parameters
            .insert("audience".into(), "aud".into());
        auth
    }

    fn with_tenant(mut auth: SaslAuth) -> SaslAuth {
        auth.sasl_oauth_tenant_id = "tenant".into();
        auth
    }

    #[rstest]
    #[case::empty_mechanism(SaslAuth::default(), false)]
    #[case::invalid_mechanism(SaslAuth { sasl_mechanism: "mech".into(), ..Default::default() }, true)]
    #[case::scram(SaslAuth { sasl_mechanism: "SCRAM-SHA-512".into(), ..Default::default() }, false)]
    #[case::missing_client_id(SaslAuth { sasl_oauth_client_id: "".into(), ..oauth("custom", "url") }, true)]
    #[case::missing_client_secret(SaslAuth { sasl_oauth_client_secret: "".into(), ..oauth("custom", "url") }, true)]
    #[case::invalid_service(oauth("auth", ""), true)]
    #[case::missing_token_url_custom(oauth("custom", ""), true)]
    #[case::missing_token_url_empty_service(oauth("", ""), true)]
    #[case::ok_custom(oauth("custom", "url"), false)]
    #[case::ok_empty_service(oauth("", "url"), false)]
    #[case::missing_token_url_auth0(oauth("auth0", ""), true)]
    #[case::missing_auth0_audience(oauth("auth0", "url"), true)]
    #[case::ok_auth0(with_audience(oauth("auth0", "url")), false)]
    #[case::ok_azure(with_tenant(oauth("azuread", "")), false)]
    #[case::azure_missing_tenant(oauth("azuread", ""), true)]
    #[case::azure_redundant_token_url(with_tenant(oauth("azuread", "url")), true)]
    #[case::access_token_with_service(SaslAuth { sasl_access_token: "tok".into(), ..oauth("auth0", "") }, true)]
    #[case::access_token_with_url(SaslAuth { sasl_access_token: "tok".into(), ..oauth("", "url") }, true)]
    #[case::access_token_alone(SaslAuth { sasl_access_token: "tok".into(), ..oauth("", "") }, false)]
    fn test_validate(#[case] auth: SaslAuth, #[case] want_err: bool) {
        let result = auth.validate();
        assert_eq!(result.is_err(), want_err, "validate() = {:?}", result);
        if let Err(err) = result {
            assert!(err.is_config_error());
        }
    }

    #[rstest]
    #[case(KafkaVersion::V2_1_0, None, Ok(SASL_HANDSHAKE_V1))]
    #[case(KafkaVersion::V1_0_0, None, Ok(SASL_HANDSHAKE_V1))]
    #[case(KafkaVersion::V0_10_0, None, Ok(SASL_HANDSHAKE_V0))]
    #[case(KafkaVersion::V2_1_0, Some(0), Ok(SASL_HANDSHAKE_V0))]
    #[case(KafkaVersion::V0_10_0, Some(1), Ok(SASL_HANDSHAKE_V1))]
    #[case(KafkaVersion::V2_1_0, Some(2), Err(()))]
    fn test_sasl_version(
        #[case] kafka: KafkaVersion,
        #[case] explicit: Option<i32>,
        #[case] want: std::result::Result<i16, ()>,
    ) {
        assert_eq!(sasl_version(kafka, explicit).map_err(|_| ()), want);
    }

    #[test]
    fn test_kafka_version_parse() {
        assert_eq!("1.0.0".parse::<KafkaVersion>().unwrap(), KafkaVersion::V1_0_0);
        assert_eq!("2.1".parse::<KafkaVersion>().unwrap(), KafkaVersion::V2_1_0);
        assert!("x.y".parse::<KafkaVersion>().is_err());
        assert!(KafkaVersion::new(3, 0, 0).is_at_least(KafkaVersion::V2_1_0));
        assert_eq!(KafkaVersion::V0_10_0.to_string(), "0.10.0");
    }

    #[test]
    fn test_username_defaults_to_plain() {
        let auth = SaslAuth {
            sasl_username: "user".into(),
            sasl_password: "pass".into(),
            ..Default::default()
        };
        let mut config = ClientConfig::new();
        auth.set_sasl_config(&mut config, KafkaVersion::DEFAULT).unwrap();
        assert!(auth.token_provider(Duration::from_secs(1)).unwrap().is_none());
        assert_eq!(config.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(config.get("sasl.username"), Some("user"));
        assert_eq!(config.get("sasl.password"), Some("pass"));
        assert_eq!(config.get("broker.version.fallback"), Some("1.0.0"));
    }

    #[test]
    fn test_disabled_sasl_leaves_config_alone() {
        let mut config = ClientConfig::new();
        SaslAuth::default()
            .set_sasl_config(&mut config, KafkaVersion::DEFAULT)
            .unwrap();
        assert_eq!(config.get("sasl.mechanism"), None);
        assert_eq!(config.get("broker.version.fallback"), None);
    }

    #[test]
    fn test_gssapi_properties() {
        let auth = SaslAuth {
            sasl_username: "kafka-client".into(),
            sasl_mechanism: "GSSAPI".into(),
            sasl_version: Some(0),
            sasl_gssapi_service_name: "kafka".into(),
            sasl_gssapi_auth_type: "KRB5_KEYTAB_AUTH".into(),
            sasl_gssapi_key_tab_path: "/etc/kafka.keytab".into(),
            sasl_gssapi_realm: "EXAMPLE.COM".into(),
            sasl_gssapi_kerberos_config_path: "/etc/krb5.conf".into(),
            ..Default::default()
        };
        let mut config = ClientConfig::new();
        auth.set_sasl_config(&mut config, KafkaVersion::DEFAULT).unwrap();
        assert_eq!(config.get("sasl.mechanism"), Some("GSSAPI"));
        assert_eq!(config.get("sasl.kerberos.service.name"), Some("kafka"));
        assert_eq!(
            config.get("sasl.kerberos.principal"),
            Some("kafka-client@EXAMPLE.COM")
        );
        assert_eq!(config.get("sasl.kerberos.keytab"), Some("/etc/kafka.keytab"));
        assert!(config
            .get("sasl.kerberos.kinit.cmd")
            .unwrap()
            .starts_with("KRB5_CONFIG=/etc/krb5.conf kinit"));
        assert_eq!(config.get("broker.version.fallback"), Some("0.10.0"));
    }

    #[test]
    fn test_static_access_token_provider() {
        let auth = SaslAuth {
            sasl_access_token: "static".into(),
            ..oauth("", "")
        };
        let mut config = ClientConfig::new();
        auth.set_sasl_config(&mut config, KafkaVersion::DEFAULT).unwrap();
        let provider = auth
            .token_provider(Duration::from_secs(1))
            .unwrap()
            .expect("OAUTHBEARER installs a provider");
        assert_eq!(provider.token().unwrap().token, "static");
        assert_eq!(config.get("sasl.mechanism"), Some("OAUTHBEARER"));
    }

    #[test]
    fn test_serde_keys_are_prefixed() {
        let auth: SaslAuth = toml::from_str(
            r#"
            sasl-mechanism = "OAUTHBEARER"
            sasl-oauth-client-id = "id"
            sasl-oauth-client-secret = "secret"
            sasl-oauth-token-url = "https://issuer/token"
            sasl-oauth-scopes = ["kafka"]
            sasl-oauth-token-expiry-margin = "30s"
            sasl-oauth-parameters = { audience = "aud" }
            "#,
        )
        .unwrap();
        assert_eq!(auth.sasl_oauth_token_expiry_margin, Duration::from_secs(30));
        assert_eq!(auth.sasl_oauth_scopes, vec!["kafka".to_string()]);
        assert_eq!(auth.sasl_oauth_parameters["audience"], "aud");
        auth.validate().unwrap();
    }
}
