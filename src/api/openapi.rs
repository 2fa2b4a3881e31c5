use super::handlers::{health, providers, session, version};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Routes served by the gateway itself, documented as they are registered.
///
/// The `/.auth/*` sign-in flows are not routes: provider middleware answers
/// them before routing, so they stay out of the document.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(version::version))
        .routes(routes!(session::sign_in))
        .routes(routes!(session::sign_out, session::sign_out_post))
        .routes(routes!(session::current))
        .routes(routes!(providers::list));

    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Liveness and build information".to_string());

    let mut session_tag = Tag::new("session");
    session_tag.description = Some("Password sign-in, sign-out and the current caller".to_string());

    router.get_openapi_mut().tags = Some(vec![health_tag, session_tag]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(non_empty(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact(env!("CARGO_PKG_AUTHORS"));
    info.license = non_empty(env!("CARGO_PKG_LICENSE")).map(|identifier| {
        let mut license = License::new(identifier);
        license.identifier = Some(identifier.to_string());
        license
    });

    OpenApiBuilder::new().info(info).build()
}

// Cargo joins authors with `:`; only the first one becomes the contact.
fn cargo_contact(authors: &str) -> Option<Contact> {
    let primary = non_empty(authors.split(':').next()?)?;
    let (name, email) = match primary.split_once('<') {
        Some((name, rest)) => (non_empty(name), non_empty(rest.trim_end_matches('>'))),
        None => (Some(primary), None),
    };
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(
            spec.info.description.as_deref(),
            Some(env!("CARGO_PKG_DESCRIPTION"))
        );

        let contact = spec.info.contact;
        assert!(contact.is_some());
        if let Some(contact) = contact {
            assert_eq!(contact.name.as_deref(), Some("Team Portiere"));
            assert_eq!(contact.email.as_deref(), Some("team@portiere.dev"));
        }

        let license = spec.info.license;
        assert!(license.is_some());
        if let Some(license) = license {
            assert_eq!(license.name, "BSD-3-Clause");
            assert_eq!(license.identifier.as_deref(), Some("BSD-3-Clause"));
        }
    }

    #[test]
    fn openapi_tags_and_paths() {
        let spec = openapi();
        let tags = spec.tags.clone().unwrap_or_default();
        assert!(tags.iter().any(|tag| tag.name == "health"));
        assert!(tags.iter().any(|tag| tag.name == "session"));
        for path in [
            "/healthz",
            "/__version",
            "/-/sign-in",
            "/-/sign-out",
            "/.api/session",
            "/.api/auth/providers",
        ] {
            assert!(spec.paths.paths.contains_key(path), "missing {path}");
        }
        assert!(!spec.paths.paths.keys().any(|path| path.starts_with("/.auth/")));
    }

    #[test]
    fn contact_parsing() {
        let contact = cargo_contact("Jane Doe <jane@example.com>:Other <o@example.com>");
        assert_eq!(
            contact.as_ref().and_then(|c| c.name.as_deref()),
            Some("Jane Doe")
        );
        assert_eq!(
            contact.as_ref().and_then(|c| c.email.as_deref()),
            Some("jane@example.com")
        );

        let contact = cargo_contact("Solo");
        assert_eq!(contact.and_then(|c| c.email), None);
        assert!(cargo_contact("").is_none());
    }
}
