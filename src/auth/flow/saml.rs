//! SAML 2.0 login (`/.auth/saml`), HTTP-POST binding in both directions.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use axum::{
    body::to_bytes,
    extract::{Query, Request},
    http::{
        HeaderMap, Method, StatusCode,
        header::{CONTENT_TYPE, SET_COOKIE},
        request::Parts,
    },
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use roxmltree::{Document, Node};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};
use url::{Url, form_urlencoded};

use super::{
    finish_login,
    login_state::{LoginOp, StateCookie},
    start_login,
    transport::OAuthTransport,
    verify_state, with_headers,
    xmldsig::{self, DSIG_NS, children, is_element},
};
use crate::auth::{
    actor::Actor,
    config::SamlAuthProvider,
    error::AuthError,
    identity::{ExternalAccountData, ExternalAccountSpec, GetAndSaveUserOp, NewUser, normalize_username},
    providers::{ConfigId, Provider, SAML_TYPE},
    state::AuthState,
};

const PREFIX: &str = "/.auth/saml/";
const POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
const MAX_ACS_BODY_BYTES: usize = 1024 * 1024;

const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
const METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
const BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";
const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Tolerated clock difference between this service and the IdP.
const CLOCK_SKEW_SECONDS: i64 = 180;

/// What the service provider needs to know about the identity provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SamlIdpMetadata {
    pub entity_id: String,
    pub sso_url: String,
    pub certificates: Vec<String>,
}

/// Claims extracted from a verified SAML response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SamlAssertion {
    pub issuer: String,
    pub name_id: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl SamlAssertion {
    fn first(&self, names: &[&str]) -> Option<String> {
        names.iter().find_map(|name| {
            self.attributes
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .and_then(|(_, values)| values.iter().find(|value| !value.is_empty()).cloned())
        })
    }
}

/// What a response posted to the ACS must match.
#[derive(Clone, Copy, Debug)]
pub struct Expectations<'a> {
    pub sp_entity_id: &'a str,
    pub acs_url: &'a str,
    /// ID of the AuthnRequest this response answers; `None` for
    /// IdP-initiated logins, which must not name one.
    pub in_response_to: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// Metadata retrieval and response verification.
#[async_trait]
pub trait SamlBackend: Send + Sync {
    async fn fetch_idp_metadata(&self, config: &SamlAuthProvider) -> Result<SamlIdpMetadata>;

    /// Verify a base64 `SAMLResponse` and return its assertion.
    async fn verify_response(
        &self,
        metadata: &SamlIdpMetadata,
        expected: &Expectations<'_>,
        saml_response: &str,
    ) -> Result<SamlAssertion>;
}

/// Fetches metadata over the OAuth transport and verifies signed responses
/// against the certificates it lists.
pub struct DefaultSamlBackend {
    transport: Arc<dyn OAuthTransport>,
}

impl DefaultSamlBackend {
    #[must_use]
    pub fn new(transport: Arc<dyn OAuthTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl SamlBackend for DefaultSamlBackend {
    async fn fetch_idp_metadata(&self, config: &SamlAuthProvider) -> Result<SamlIdpMetadata> {
        let xml = match (
            &config.identity_provider_metadata_url,
            &config.identity_provider_metadata,
        ) {
            (Some(url), _) => self
                .transport
                .get_text(url)
                .await
                .context("failed to fetch IdP metadata")?,
            (None, Some(inline)) => inline.clone(),
            (None, None) => return Err(anyhow!("no IdP metadata configured")),
        };
        parse_idp_metadata(&xml)
    }

    async fn verify_response(
        &self,
        metadata: &SamlIdpMetadata,
        expected: &Expectations<'_>,
        saml_response: &str,
    ) -> Result<SamlAssertion> {
        let xml = decode_response(saml_response)?;
        verify_response_xml(&xml, metadata, expected)
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn text_of(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(Node::is_text)
        .filter_map(|text| text.text())
        .collect::<String>()
        .trim()
        .to_string()
}

fn child<'a, 'input: 'a>(node: Node<'a, 'input>, ns: &'a str, name: &'a str) -> Option<Node<'a, 'input>> {
    children(node, ns, name).next()
}

fn instant(node: Node<'_, '_>, name: &str) -> Result<Option<DateTime<Utc>>> {
    node.attribute(name)
        .map(|value| {
            DateTime::parse_from_rfc3339(value)
                .map(|instant| instant.with_timezone(&Utc))
                .with_context(|| format!("invalid {name} {value}"))
        })
        .transpose()
}

/// Extract entity ID, HTTP-POST SSO endpoint and signing certificates.
///
/// # Errors
/// Returns an error if the document is not XML or lacks an entity ID or a
/// POST endpoint.
pub fn parse_idp_metadata(xml: &str) -> Result<SamlIdpMetadata> {
    let document = Document::parse(xml).context("IdP metadata is not valid XML")?;
    let descriptor = document
        .descendants()
        .find(|node| is_element(*node, METADATA_NS, "EntityDescriptor"))
        .ok_or_else(|| anyhow!("IdP metadata has no EntityDescriptor"))?;
    let entity_id = descriptor
        .attribute("entityID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| anyhow!("IdP metadata has no entityID"))?
        .to_string();
    let idp = child(descriptor, METADATA_NS, "IDPSSODescriptor")
        .ok_or_else(|| anyhow!("IdP metadata has no IDPSSODescriptor"))?;

    let sso_url = children(idp, METADATA_NS, "SingleSignOnService")
        .find(|service| service.attribute("Binding") == Some(POST_BINDING))
        .and_then(|service| service.attribute("Location"))
        .ok_or_else(|| anyhow!("IdP metadata has no HTTP-POST SingleSignOnService"))?
        .to_string();
    Url::parse(&sso_url).with_context(|| format!("invalid SSO URL: {sso_url}"))?;

    let certificates = children(idp, METADATA_NS, "KeyDescriptor")
        .filter(|key| key.attribute("use").is_none_or(|usage| usage == "signing"))
        .flat_map(|key| key.descendants().filter(|node| is_element(*node, DSIG_NS, "X509Certificate")))
        .map(|certificate| text_of(certificate).split_whitespace().collect::<String>())
        .filter(|certificate| !certificate.is_empty())
        .collect();

    Ok(SamlIdpMetadata {
        entity_id,
        sso_url,
        certificates,
    })
}

fn decode_response(saml_response: &str) -> Result<String> {
    let compact: String = saml_response.split_whitespace().collect();
    let bytes = STANDARD.decode(compact).context("SAMLResponse is not valid base64")?;
    String::from_utf8(bytes).context("SAMLResponse is not UTF-8")
}

fn response_root<'a, 'input>(document: &'a Document<'input>) -> Result<Node<'a, 'input>> {
    let root = document.root_element();
    if !is_element(root, PROTOCOL_NS, "Response") {
        bail!("SAML document is not a Response");
    }
    Ok(root)
}

/// Issuer named by a base64 `SAMLResponse`, read before verification to
/// pick the provider of an IdP-initiated login.
///
/// # Errors
/// Returns an error if the response cannot be decoded or names no issuer.
pub fn response_issuer(saml_response: &str) -> Result<String> {
    let xml = decode_response(saml_response)?;
    let document = Document::parse(&xml).context("SAML response is not valid XML")?;
    let response = response_root(&document)?;
    child(response, ASSERTION_NS, "Issuer")
        .or_else(|| {
            child(response, ASSERTION_NS, "Assertion")
                .and_then(|assertion| child(assertion, ASSERTION_NS, "Issuer"))
        })
        .map(text_of)
        .filter(|issuer| !issuer.is_empty())
        .ok_or_else(|| anyhow!("SAML response has no issuer"))
}

/// Verify a decoded response and extract its assertion.
///
/// The response must carry exactly one assertion, signed itself or through
/// a signed response, and every claim is read from that element only.
///
/// # Errors
/// Returns an error describing the first failed check.
pub fn verify_response_xml(
    xml: &str,
    metadata: &SamlIdpMetadata,
    expected: &Expectations<'_>,
) -> Result<SamlAssertion> {
    let document = Document::parse(xml).context("SAML response is not valid XML")?;
    let response = response_root(&document)?;
    if child(response, ASSERTION_NS, "EncryptedAssertion").is_some() {
        bail!("encrypted assertions are not supported");
    }
    let mut assertions = children(response, ASSERTION_NS, "Assertion");
    let assertion = assertions
        .next()
        .ok_or_else(|| anyhow!("SAML response has no assertion"))?;
    if assertions.next().is_some() {
        bail!("SAML response carries more than one assertion");
    }

    let response_signed = xmldsig::signature_of(response)?.is_some();
    if response_signed {
        xmldsig::verify(response, &metadata.certificates).context("invalid response signature")?;
    }
    if xmldsig::signature_of(assertion)?.is_some() {
        xmldsig::verify(assertion, &metadata.certificates).context("invalid assertion signature")?;
    } else if !response_signed {
        bail!("SAML response is not signed");
    }

    check_response(response, metadata, expected)?;
    check_assertion(assertion, metadata, expected)
}

fn check_in_response_to(node: Node<'_, '_>, expected: &Expectations<'_>) -> Result<()> {
    match (node.attribute("InResponseTo"), expected.in_response_to) {
        (None, _) => Ok(()),
        (Some(actual), Some(request)) if actual == request => Ok(()),
        (Some(actual), Some(request)) => {
            bail!("<{}> answers {actual}, not {request}", node.tag_name().name())
        }
        (Some(actual), None) => bail!("unsolicited response answers {actual}"),
    }
}

fn check_response(
    response: Node<'_, '_>,
    metadata: &SamlIdpMetadata,
    expected: &Expectations<'_>,
) -> Result<()> {
    let status = child(response, PROTOCOL_NS, "Status")
        .and_then(|status| child(status, PROTOCOL_NS, "StatusCode"))
        .and_then(|code| code.attribute("Value"))
        .ok_or_else(|| anyhow!("SAML response has no status"))?;
    if status != STATUS_SUCCESS {
        bail!("SAML response status is {status}");
    }
    if let Some(destination) = response.attribute("Destination") {
        if destination != expected.acs_url {
            bail!("SAML response destination {destination} is not {}", expected.acs_url);
        }
    }
    if let Some(issuer) = child(response, ASSERTION_NS, "Issuer").map(text_of) {
        if issuer != metadata.entity_id {
            bail!("SAML response issuer {issuer} is not {}", metadata.entity_id);
        }
    }
    if expected.in_response_to.is_some() && response.attribute("InResponseTo").is_none() {
        bail!("SAML response does not answer the login request");
    }
    check_in_response_to(response, expected)
}

fn check_assertion(
    assertion: Node<'_, '_>,
    metadata: &SamlIdpMetadata,
    expected: &Expectations<'_>,
) -> Result<SamlAssertion> {
    let skew = Duration::seconds(CLOCK_SKEW_SECONDS);
    let issuer = child(assertion, ASSERTION_NS, "Issuer")
        .map(text_of)
        .ok_or_else(|| anyhow!("SAML assertion has no issuer"))?;
    if issuer != metadata.entity_id {
        bail!("SAML assertion issuer {issuer} is not {}", metadata.entity_id);
    }

    let subject = child(assertion, ASSERTION_NS, "Subject")
        .ok_or_else(|| anyhow!("SAML assertion has no subject"))?;
    let name_id = child(subject, ASSERTION_NS, "NameID")
        .map(text_of)
        .filter(|name_id| !name_id.is_empty())
        .ok_or_else(|| anyhow!("SAML assertion has no NameID"))?;

    let mut confirmed = Err(anyhow!("SAML assertion has no bearer confirmation"));
    for confirmation in children(subject, ASSERTION_NS, "SubjectConfirmation")
        .filter(|confirmation| confirmation.attribute("Method") == Some(BEARER))
    {
        confirmed = child(confirmation, ASSERTION_NS, "SubjectConfirmationData")
            .ok_or_else(|| anyhow!("bearer confirmation has no data"))
            .and_then(|data| check_confirmation(data, expected, skew));
        if confirmed.is_ok() {
            break;
        }
    }
    confirmed?;

    if let Some(conditions) = child(assertion, ASSERTION_NS, "Conditions") {
        if let Some(not_before) = instant(conditions, "NotBefore")? {
            if expected.now + skew < not_before {
                bail!("SAML assertion is not valid before {not_before}");
            }
        }
        if let Some(not_on_or_after) = instant(conditions, "NotOnOrAfter")? {
            if expected.now - skew >= not_on_or_after {
                bail!("SAML assertion expired at {not_on_or_after}");
            }
        }
        for restriction in children(conditions, ASSERTION_NS, "AudienceRestriction") {
            if !children(restriction, ASSERTION_NS, "Audience")
                .any(|audience| text_of(audience) == expected.sp_entity_id)
            {
                bail!("SAML assertion is not addressed to {}", expected.sp_entity_id);
            }
        }
    }

    let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for statement in children(assertion, ASSERTION_NS, "AttributeStatement") {
        for attribute in children(statement, ASSERTION_NS, "Attribute") {
            let Some(name) = attribute.attribute("Name") else {
                continue;
            };
            attributes
                .entry(name.to_string())
                .or_default()
                .extend(children(attribute, ASSERTION_NS, "AttributeValue").map(text_of));
        }
    }

    Ok(SamlAssertion {
        issuer,
        name_id,
        attributes,
    })
}

fn check_confirmation(data: Node<'_, '_>, expected: &Expectations<'_>, skew: Duration) -> Result<()> {
    let not_on_or_after = instant(data, "NotOnOrAfter")?
        .ok_or_else(|| anyhow!("bearer confirmation has no NotOnOrAfter"))?;
    if expected.now - skew >= not_on_or_after {
        bail!("bearer confirmation expired at {not_on_or_after}");
    }
    if let Some(recipient) = data.attribute("Recipient") {
        if recipient != expected.acs_url {
            bail!("bearer confirmation is for {recipient}, not {}", expected.acs_url);
        }
    }
    check_in_response_to(data, expected)
}

/// AuthnRequest ID bound to the relay state of one login attempt.
fn request_id(relay_state: &str) -> String {
    let digest = Sha256::digest(relay_state.as_bytes());
    format!(
        "_{}",
        digest[..20].iter().map(|b| format!("{b:02x}")).collect::<String>()
    )
}

fn authn_request(metadata: &SamlIdpMetadata, sp_entity_id: &str, acs_url: &str, id: &str) -> String {
    format!(
        concat!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" "#,
            r#"xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" "#,
            r#"IssueInstant="{instant}" Destination="{destination}" "#,
            r#"AssertionConsumerServiceURL="{acs}" ProtocolBinding="{binding}">"#,
            r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
            r#"<samlp:NameIDPolicy AllowCreate="true"/>"#,
            r#"</samlp:AuthnRequest>"#
        ),
        id = xml_escape(id),
        instant = Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        destination = xml_escape(&metadata.sso_url),
        acs = xml_escape(acs_url),
        binding = POST_BINDING,
        issuer = xml_escape(sp_entity_id),
    )
}

/// Self-submitting HTML form for the HTTP-POST binding.
fn post_form(action: &str, fields: &[(&str, &str)]) -> String {
    let inputs: String = fields
        .iter()
        .map(|(name, value)| {
            format!(
                r#"<input type="hidden" name="{}" value="{}">"#,
                xml_escape(name),
                xml_escape(value)
            )
        })
        .collect();
    format!(
        concat!(
            "<!DOCTYPE html><html><body onload=\"document.forms[0].submit()\">",
            "<form method=\"post\" action=\"{action}\">{inputs}",
            "<noscript><input type=\"submit\" value=\"Continue\"></noscript>",
            "</form></body></html>"
        ),
        action = xml_escape(action),
        inputs = inputs,
    )
}

fn sp_metadata(sp_entity_id: &str, acs_url: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{entity}">"#,
            r#"<md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="true" "#,
            r#"protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#,
            r#"<md:AssertionConsumerService Binding="{binding}" Location="{acs}" index="0" isDefault="true"/>"#,
            r#"</md:SPSSODescriptor></md:EntityDescriptor>"#
        ),
        entity = xml_escape(sp_entity_id),
        binding = POST_BINDING,
        acs = xml_escape(acs_url),
    )
}

fn state_cookie(state: &AuthState) -> StateCookie {
    StateCookie::cross_site(SAML_TYPE)
}

fn acs_url(state: &AuthState) -> Result<Url, AuthError> {
    state
        .config()
        .external_url()
        .join(".auth/saml/acs")
        .map_err(|err| AuthError::Config(anyhow!(err)))
}

/// Entity ID of this service provider for `config`.
fn sp_entity_id(state: &AuthState, config: &SamlAuthProvider) -> Result<String, AuthError> {
    match config
        .service_provider_issuer
        .as_deref()
        .filter(|issuer| !issuer.is_empty())
    {
        Some(issuer) => Ok(issuer.to_string()),
        None => state
            .config()
            .external_url()
            .join(".auth/saml/metadata")
            .map(String::from)
            .map_err(|err| AuthError::Config(anyhow!(err))),
    }
}

async fn lookup_provider(state: &AuthState, pc: Option<&str>) -> Result<Arc<Provider>, AuthError> {
    let provider = match pc.filter(|pc| !pc.is_empty()) {
        Some(pc) => {
            state
                .registry()
                .get_provider_by_config_id(&ConfigId::new(SAML_TYPE, pc))
                .await
        }
        None => state.registry().get_provider_by_service_type(SAML_TYPE).await,
    };
    provider
        .filter(|provider| provider.saml().is_some())
        .ok_or(AuthError::BadRequest("Unknown authentication provider."))
}

async fn idp_metadata(
    state: &AuthState,
    provider: &Provider,
) -> Result<Arc<SamlIdpMetadata>, AuthError> {
    let Some((_, cache)) = provider.saml() else {
        return Err(AuthError::BadRequest("Unknown authentication provider."));
    };
    if let Some(metadata) = cache.get() {
        return Ok(metadata);
    }
    provider
        .refresh(state.clients())
        .await
        .map_err(AuthError::Config)?;
    cache
        .get()
        .ok_or_else(|| AuthError::Config(anyhow!("SAML IdP metadata unavailable")))
}

/// The SAML provider whose IdP metadata names `issuer`.
async fn provider_for_issuer(state: &AuthState, issuer: &str) -> Result<Arc<Provider>, AuthError> {
    for provider in state.registry().providers().await {
        if provider.saml().is_none() {
            continue;
        }
        match idp_metadata(state, &provider).await {
            Ok(metadata) if metadata.entity_id == issuer => return Ok(provider),
            Ok(_) => {}
            Err(err) => {
                warn!(provider = %provider.config_id(), "SAML metadata unavailable: {err}");
            }
        }
    }
    debug!(issuer, "no SAML provider for unsolicited response");
    Err(AuthError::BadRequest("Unknown authentication provider."))
}

#[derive(Debug, Default, Deserialize)]
struct LoginParams {
    pc: Option<String>,
    redirect: Option<String>,
    op: Option<LoginOp>,
}

#[derive(Clone, Copy)]
enum Action {
    Login,
    Acs,
    Metadata,
}

/// Serve `/.auth/saml/login`, `/acs` (POST) and `/metadata`.
pub async fn intercept(state: Arc<AuthState>, req: Request) -> Result<Response, Request> {
    let action = match (req.method(), req.uri().path().strip_prefix(PREFIX)) {
        (&Method::GET, Some("login")) => Action::Login,
        (&Method::POST, Some("acs")) => Action::Acs,
        (&Method::GET, Some("metadata")) => Action::Metadata,
        _ => return Err(req),
    };
    let (parts, body) = req.into_parts();
    let response = match action {
        Action::Login => login(&state, &parts)
            .await
            .unwrap_or_else(IntoResponse::into_response),
        Action::Metadata => metadata(&state, &parts)
            .await
            .unwrap_or_else(IntoResponse::into_response),
        Action::Acs => match to_bytes(body, MAX_ACS_BODY_BYTES).await {
            Ok(body) => acs(&state, &parts, &body).await,
            Err(_) => AuthError::BadRequest("Invalid SAML response.").into_response(),
        },
    };
    Ok(response)
}

async fn login(state: &AuthState, req: &Parts) -> Result<Response, AuthError> {
    let Query(params) = Query::<LoginParams>::try_from_uri(&req.uri)
        .map_err(|_| AuthError::BadRequest("Invalid login parameters."))?;
    let actor = req.extensions.get::<Actor>().copied().unwrap_or_default();
    let provider = lookup_provider(state, params.pc.as_deref()).await?;
    let Some((config, _)) = provider.saml() else {
        return Err(AuthError::BadRequest("Unknown authentication provider."));
    };
    let metadata = idp_metadata(state, &provider).await?;

    let (encoded, set_cookie) = start_login(
        state,
        &req.headers,
        &actor,
        state_cookie(state),
        &provider,
        params.redirect.as_deref(),
        params.op,
    )?;
    let request = authn_request(
        &metadata,
        &sp_entity_id(state, config)?,
        acs_url(state)?.as_str(),
        &request_id(&encoded),
    );
    let saml_request = STANDARD.encode(request);
    let form = post_form(
        &metadata.sso_url,
        &[
            ("SAMLRequest", saml_request.as_str()),
            ("RelayState", encoded.as_str()),
        ],
    );

    let mut headers = HeaderMap::new();
    headers.append(SET_COOKIE, set_cookie);
    Ok(with_headers(
        (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/html; charset=utf-8")],
            form,
        )
            .into_response(),
        headers,
    ))
}

async fn metadata(state: &AuthState, req: &Parts) -> Result<Response, AuthError> {
    let Query(params) = Query::<LoginParams>::try_from_uri(&req.uri)
        .map_err(|_| AuthError::BadRequest("Invalid metadata parameters."))?;
    let provider = lookup_provider(state, params.pc.as_deref()).await?;
    let Some((config, _)) = provider.saml() else {
        return Err(AuthError::BadRequest("Unknown authentication provider."));
    };
    let document = sp_metadata(&sp_entity_id(state, config)?, acs_url(state)?.as_str());
    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/samlmetadata+xml")],
        document,
    )
        .into_response())
}

async fn acs(state: &AuthState, req: &Parts, body: &[u8]) -> Response {
    let cookie = state_cookie(state);
    let mut headers = HeaderMap::new();
    if let Ok(clear) = cookie.clear() {
        headers.append(SET_COOKIE, clear);
    }
    let response = match complete(state, cookie, req, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    with_headers(response, headers)
}

async fn complete(
    state: &AuthState,
    cookie: StateCookie,
    req: &Parts,
    body: &[u8],
) -> Result<Response, AuthError> {
    let mut saml_response = None;
    let mut relay_state = String::new();
    for (key, value) in form_urlencoded::parse(body) {
        match key.as_ref() {
            "SAMLResponse" => saml_response = Some(value.into_owned()),
            "RelayState" => relay_state = value.into_owned(),
            _ => {}
        }
    }
    let saml_response = saml_response
        .filter(|value| !value.is_empty())
        .ok_or(AuthError::BadRequest("Missing SAML response."))?;

    // IdP-initiated logins carry no RelayState and land on the home page.
    let (provider, redirect, in_response_to) = if relay_state.is_empty() {
        let issuer = response_issuer(&saml_response).map_err(AuthError::IdentityProvider)?;
        (provider_for_issuer(state, &issuer).await?, "/".to_string(), None)
    } else {
        let login_state = verify_state(&req.headers, cookie, Some(&relay_state))?;
        if login_state.provider_id.kind != SAML_TYPE {
            return Err(AuthError::BadRequest("Invalid login state."));
        }
        let provider = state
            .registry()
            .get_provider_by_config_id(&login_state.provider_id)
            .await
            .filter(|provider| provider.saml().is_some())
            .ok_or(AuthError::BadRequest("Unknown authentication provider."))?;
        (provider, login_state.redirect, Some(request_id(&relay_state)))
    };
    let Some((config, _)) = provider.saml() else {
        return Err(AuthError::BadRequest("Unknown authentication provider."));
    };
    let metadata = idp_metadata(state, &provider).await?;
    let sp_entity_id = sp_entity_id(state, config)?;
    let acs_url = acs_url(state)?;
    let expected = Expectations {
        sp_entity_id: &sp_entity_id,
        acs_url: acs_url.as_str(),
        in_response_to: in_response_to.as_deref(),
        now: Utc::now(),
    };
    let assertion = state
        .clients()
        .saml
        .verify_response(&metadata, &expected, &saml_response)
        .await
        .map_err(AuthError::IdentityProvider)?;

    let op = assertion_to_op(&provider, config, &assertion)?;
    let actor = req.extensions.get::<Actor>().copied().unwrap_or_default();
    finish_login(state, &req.headers, &actor, op, &redirect, None).await
}

fn assertion_to_op(
    provider: &Provider,
    config: &SamlAuthProvider,
    assertion: &SamlAssertion,
) -> Result<GetAndSaveUserOp, AuthError> {
    let email = assertion
        .first(&[
            "email",
            "emailaddress",
            "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress",
        ])
        .or_else(|| Some(assertion.name_id.clone()).filter(|name_id| name_id.contains('@')));
    let configured: Vec<&str> = config
        .username_attribute_names
        .iter()
        .map(String::as_str)
        .collect();
    let asserted = assertion
        .first(&configured)
        .or_else(|| assertion.first(&["username", "uid", "login"]))
        .or_else(|| email.clone())
        .unwrap_or_else(|| assertion.name_id.clone());
    let username = normalize_username(&asserted).map_err(AuthError::IdentityProvider)?;
    if email.is_none() {
        warn!(provider = %provider.config_id(), "SAML assertion carries no email address");
    }

    let info = provider.cached_info();
    Ok(GetAndSaveUserOp {
        user_props: NewUser {
            username,
            email_is_verified: email.is_some(),
            email,
            display_name: assertion
                .first(&[
                    "displayName",
                    "name",
                    "http://schemas.microsoft.com/identity/claims/displayname",
                ])
                .unwrap_or_default(),
            avatar_url: String::new(),
        },
        external_account: ExternalAccountSpec {
            service_type: SAML_TYPE.to_string(),
            service_id: assertion.issuer.clone(),
            client_id: info.client_id.clone(),
            account_id: assertion.name_id.clone(),
        },
        external_account_data: ExternalAccountData {
            auth_data: None,
            account_data: serde_json::to_value(&assertion.attributes).ok(),
        },
        create_if_not_exist: config.allow_signup,
        lookup_by_username: false,
    })
}

/// Encode a response for tests and tooling that post to the ACS endpoint.
#[must_use]
pub fn encode_response(xml: &str) -> String {
    STANDARD.encode(xml)
}
