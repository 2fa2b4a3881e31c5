//! Signed-in user profile lookup for the OAuth code-host families.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::transport::OAuthTransport;
use crate::auth::providers::OAuthServiceType;

/// Identity asserted by an external source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalProfile {
    pub account_id: String,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub display_name: String,
    pub avatar_url: String,
}

#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    /// Fetch the profile of the user owning `access_token`, returning the
    /// profile and the raw account document to store with the link.
    async fn fetch_profile(
        &self,
        transport: &dyn OAuthTransport,
        service_type: OAuthServiceType,
        base_url: &Url,
        access_token: &str,
    ) -> Result<(ExternalProfile, Value)>;
}

/// Reads the "current user" endpoint of each code host.
pub struct HttpProfileFetcher;

fn api_url(service_type: OAuthServiceType, base_url: &Url) -> Result<Url> {
    let url = match service_type {
        OAuthServiceType::GitHub if base_url.host_str() == Some("github.com") => {
            Url::parse("https://api.github.com/user")
        }
        OAuthServiceType::GitHub => base_url.join("api/v3/user"),
        OAuthServiceType::GitLab => base_url.join("api/v4/user"),
        OAuthServiceType::BitbucketCloud => Url::parse("https://api.bitbucket.org/2.0/user"),
    };
    url.context("failed to build profile URL")
}

fn string_field(value: &Value, field: &str) -> String {
    match value.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn parse_profile(service_type: OAuthServiceType, raw: &Value) -> Result<ExternalProfile> {
    let profile = match service_type {
        OAuthServiceType::GitHub => ExternalProfile {
            account_id: string_field(raw, "id"),
            username: string_field(raw, "login"),
            // GitHub only exposes a verified address as the public email.
            email: Some(string_field(raw, "email")).filter(|email| !email.is_empty()),
            email_verified: true,
            display_name: string_field(raw, "name"),
            avatar_url: string_field(raw, "avatar_url"),
        },
        OAuthServiceType::GitLab => ExternalProfile {
            account_id: string_field(raw, "id"),
            username: string_field(raw, "username"),
            email: Some(string_field(raw, "email")).filter(|email| !email.is_empty()),
            email_verified: raw.get("confirmed_at").is_some_and(|v| !v.is_null()),
            display_name: string_field(raw, "name"),
            avatar_url: string_field(raw, "avatar_url"),
        },
        OAuthServiceType::BitbucketCloud => ExternalProfile {
            account_id: string_field(raw, "uuid"),
            username: string_field(raw, "username"),
            email: None,
            email_verified: false,
            display_name: string_field(raw, "display_name"),
            avatar_url: raw
                .pointer("/links/avatar/href")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
    };
    if profile.account_id.is_empty() || profile.username.is_empty() {
        return Err(anyhow!(
            "{} profile is missing the account id or username",
            service_type.as_str()
        ));
    }
    Ok(profile)
}

#[async_trait]
impl ProfileFetcher for HttpProfileFetcher {
    async fn fetch_profile(
        &self,
        transport: &dyn OAuthTransport,
        service_type: OAuthServiceType,
        base_url: &Url,
        access_token: &str,
    ) -> Result<(ExternalProfile, Value)> {
        let url = api_url(service_type, base_url)?;
        let raw = transport
            .get_json(url.as_str(), Some(access_token))
            .await
            .with_context(|| format!("failed to fetch {} profile", service_type.as_str()))?;
        let profile = parse_profile(service_type, &raw)?;
        Ok((profile, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn profile_urls_per_host() -> Result<()> {
        let github = Url::parse("https://github.com/")?;
        assert_eq!(
            api_url(OAuthServiceType::GitHub, &github)?.as_str(),
            "https://api.github.com/user"
        );
        let ghe = Url::parse("https://ghe.example.com/")?;
        assert_eq!(
            api_url(OAuthServiceType::GitHub, &ghe)?.as_str(),
            "https://ghe.example.com/api/v3/user"
        );
        let gitlab = Url::parse("https://gitlab.example.com/")?;
        assert_eq!(
            api_url(OAuthServiceType::GitLab, &gitlab)?.as_str(),
            "https://gitlab.example.com/api/v4/user"
        );
        Ok(())
    }

    #[test]
    fn parses_github_profile() -> Result<()> {
        let raw = json!({
            "id": 42,
            "login": "octocat",
            "email": "octo@example.com",
            "name": "The Octocat",
            "avatar_url": "https://avatars/42"
        });
        let profile = parse_profile(OAuthServiceType::GitHub, &raw)?;
        assert_eq!(profile.account_id, "42");
        assert_eq!(profile.username, "octocat");
        assert_eq!(profile.email.as_deref(), Some("octo@example.com"));
        Ok(())
    }

    #[test]
    fn gitlab_email_requires_confirmation() -> Result<()> {
        let raw = json!({"id": 7, "username": "gl", "email": "gl@example.com", "confirmed_at": null});
        assert!(!parse_profile(OAuthServiceType::GitLab, &raw)?.email_verified);
        Ok(())
    }

    #[test]
    fn rejects_profile_without_identity() {
        let raw = json!({"login": "octocat"});
        assert!(parse_profile(OAuthServiceType::GitHub, &raw).is_err());
    }
}
