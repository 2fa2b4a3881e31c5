//! Enveloped XML signatures as SAML identity providers produce them:
//! exclusive canonicalization, SHA-256 digests and RSA-SHA256 signature values.

use anyhow::{Context, Result, anyhow, bail};
use base64::{Engine, engine::general_purpose::STANDARD};
use roxmltree::{Node, NodeType};
use rsa::{
    RsaPublicKey,
    pkcs1v15::{Signature, VerifyingKey},
    pkcs8::DecodePublicKey,
    signature::Verifier,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Whether `node` is the element `{ns}name`.
#[must_use]
pub fn is_element(node: Node<'_, '_>, ns: &str, name: &str) -> bool {
    node.is_element() && node.tag_name().namespace() == Some(ns) && node.tag_name().name() == name
}

/// Child elements named `{ns}name`.
pub fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    ns: &'a str,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |child| is_element(*child, ns, name))
}

fn single<'a, 'input: 'a>(node: Node<'a, 'input>, ns: &'a str, name: &'a str) -> Result<Node<'a, 'input>> {
    let mut found = children(node, ns, name);
    let first = found
        .next()
        .ok_or_else(|| anyhow!("<{}> has no <{name}>", node.tag_name().name()))?;
    if found.next().is_some() {
        bail!("<{}> has more than one <{name}>", node.tag_name().name());
    }
    Ok(first)
}

fn algorithm<'a>(node: Node<'a, '_>) -> Result<&'a str> {
    node.attribute("Algorithm")
        .ok_or_else(|| anyhow!("<{}> has no Algorithm", node.tag_name().name()))
}

fn base64_text(node: Node<'_, '_>) -> Result<Vec<u8>> {
    let compact: String = node.text().unwrap_or_default().split_whitespace().collect();
    STANDARD
        .decode(compact)
        .with_context(|| format!("<{}> is not valid base64", node.tag_name().name()))
}

/// `PrefixList` of an `InclusiveNamespaces` child; `#default` becomes `""`.
fn inclusive_prefixes(transform: Node<'_, '_>) -> Vec<String> {
    children(transform, EXC_C14N, "InclusiveNamespaces")
        .filter_map(|node| node.attribute("PrefixList"))
        .flat_map(str::split_whitespace)
        .map(|prefix| if prefix == "#default" { String::new() } else { prefix.to_string() })
        .collect()
}

/// The `ds:Signature` directly enveloped by `element`.
///
/// # Errors
/// Returns an error if `element` carries more than one.
pub fn signature_of<'a, 'input>(element: Node<'a, 'input>) -> Result<Option<Node<'a, 'input>>> {
    let mut signatures = children(element, DSIG_NS, "Signature");
    let first = signatures.next();
    if signatures.next().is_some() {
        bail!("<{}> carries more than one signature", element.tag_name().name());
    }
    Ok(first)
}

/// Verify the enveloped signature of `element` against any of the base64
/// DER `certificates`. Keys embedded in the signature are ignored.
///
/// # Errors
/// Returns an error if the element is unsigned, the signature uses anything
/// but exclusive C14N with RSA-SHA256, the digest differs, or no certificate
/// validates the signature value.
pub fn verify(element: Node<'_, '_>, certificates: &[String]) -> Result<()> {
    let signature = signature_of(element)?
        .ok_or_else(|| anyhow!("<{}> is not signed", element.tag_name().name()))?;
    let signed_info = single(signature, DSIG_NS, "SignedInfo")?;

    let canonicalization = single(signed_info, DSIG_NS, "CanonicalizationMethod")?;
    if algorithm(canonicalization)? != EXC_C14N {
        bail!("unsupported canonicalization {}", algorithm(canonicalization)?);
    }
    let signature_method = algorithm(single(signed_info, DSIG_NS, "SignatureMethod")?)?;
    if signature_method != RSA_SHA256 {
        bail!("unsupported signature method {signature_method}");
    }

    let reference = single(signed_info, DSIG_NS, "Reference")?;
    let id = element
        .attribute("ID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| anyhow!("signed <{}> has no ID", element.tag_name().name()))?;
    if reference.attribute("URI") != Some(format!("#{id}").as_str()) {
        bail!("signature does not reference {id}");
    }
    let owners = element
        .document()
        .descendants()
        .filter(|node| node.attribute("ID") == Some(id))
        .count();
    if owners != 1 {
        bail!("ID {id} is not unique");
    }

    let mut enveloped = false;
    let mut prefixes = Vec::new();
    for transforms in children(reference, DSIG_NS, "Transforms") {
        for transform in children(transforms, DSIG_NS, "Transform") {
            match algorithm(transform)? {
                ENVELOPED_SIGNATURE => enveloped = true,
                EXC_C14N => prefixes = inclusive_prefixes(transform),
                other => bail!("unsupported transform {other}"),
            }
        }
    }
    if !enveloped {
        bail!("signature is not enveloped");
    }

    let digest_method = algorithm(single(reference, DSIG_NS, "DigestMethod")?)?;
    if digest_method != SHA256 {
        bail!("unsupported digest method {digest_method}");
    }
    let expected = base64_text(single(reference, DSIG_NS, "DigestValue")?)?;
    let canonical = canonicalize(element, Some(signature), &prefixes)?;
    if Sha256::digest(canonical.as_bytes()).as_slice() != expected.as_slice() {
        bail!("digest of <{}> does not match", element.tag_name().name());
    }

    let signed = canonicalize(signed_info, None, &inclusive_prefixes(canonicalization))?;
    let value = base64_text(single(signature, DSIG_NS, "SignatureValue")?)?;
    let value = Signature::try_from(value.as_slice()).context("malformed signature value")?;
    let mut outcome = Err(anyhow!("identity provider metadata has no signing certificate"));
    for certificate in certificates {
        outcome = verifying_key(certificate).and_then(|key| {
            key.verify(signed.as_bytes(), &value)
                .map_err(|err| anyhow!("signature value does not match: {err}"))
        });
        if outcome.is_ok() {
            break;
        }
    }
    outcome
}

fn verifying_key(certificate: &str) -> Result<VerifyingKey<Sha256>> {
    let der = STANDARD
        .decode(certificate)
        .context("IdP certificate is not base64")?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&der)
        .map_err(|err| anyhow!("invalid IdP certificate: {err}"))?;
    let key = RsaPublicKey::from_public_key_der(parsed.public_key().raw)
        .map_err(|err| anyhow!("IdP certificate does not hold an RSA key: {err}"))?;
    Ok(VerifyingKey::new(key))
}

/// Exclusive XML canonicalization, without comments, of the subtree rooted
/// at `apex`. `exclude` is left out entirely; `inclusive` lists the prefixes
/// rendered wherever they are in scope.
///
/// # Errors
/// Returns an error if a prefix cannot be recovered from the source.
pub fn canonicalize<'a, 'input>(
    apex: Node<'a, 'input>,
    exclude: Option<Node<'a, 'input>>,
    inclusive: &[String],
) -> Result<String> {
    let mut out = String::new();
    render(apex, exclude, inclusive, &BTreeMap::new(), &mut out)?;
    Ok(out)
}

fn render<'a, 'input>(
    node: Node<'a, 'input>,
    exclude: Option<Node<'a, 'input>>,
    inclusive: &[String],
    rendered: &BTreeMap<String, String>,
    out: &mut String,
) -> Result<()> {
    let prefix = element_prefix(node)?;
    let mut utilized = vec![(
        prefix.clone(),
        node.tag_name().namespace().unwrap_or_default().to_string(),
    )];

    let mut attributes = Vec::new();
    for attribute in node.attributes() {
        let (qualifier, uri) = match attribute.namespace() {
            None => (String::new(), ""),
            Some(XML_NS) => ("xml".to_string(), XML_NS),
            Some(uri) => {
                let qualifier = attribute_prefix(node, uri)?;
                utilized.push((qualifier.clone(), uri.to_string()));
                (qualifier, uri)
            }
        };
        attributes.push((uri, attribute.name(), qualifier, attribute.value()));
    }
    attributes.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    for name in inclusive {
        if utilized.iter().any(|(utilized, _)| utilized == name) {
            continue;
        }
        if let Some(ns) = node
            .namespaces()
            .find(|ns| ns.name().unwrap_or_default() == name.as_str())
        {
            utilized.push((name.clone(), ns.uri().to_string()));
        }
    }

    let mut scope = rendered.clone();
    let mut declarations = BTreeMap::new();
    for (name, uri) in utilized {
        if name == "xml" {
            continue;
        }
        let differs = match scope.get(&name) {
            Some(current) => *current != uri,
            None => !(name.is_empty() && uri.is_empty()),
        };
        if differs {
            declarations.insert(name.clone(), uri.clone());
            scope.insert(name, uri);
        }
    }

    let qname = qualified(&prefix, node.tag_name().name());
    out.push('<');
    out.push_str(&qname);
    for (name, uri) in &declarations {
        if name.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(name);
            out.push_str("=\"");
        }
        escape_attribute(uri, out);
        out.push('"');
    }
    for (_, name, qualifier, value) in &attributes {
        out.push(' ');
        out.push_str(&qualified(qualifier, name));
        out.push_str("=\"");
        escape_attribute(value, out);
        out.push('"');
    }
    out.push('>');

    for child in node.children() {
        if Some(child) == exclude {
            continue;
        }
        match child.node_type() {
            NodeType::Element => render(child, exclude, inclusive, &scope, out)?,
            NodeType::Text => escape_text(child.text().unwrap_or_default(), out),
            NodeType::PI => {
                if let Some(pi) = child.pi() {
                    out.push_str("<?");
                    out.push_str(pi.target);
                    if let Some(value) = pi.value {
                        out.push(' ');
                        out.push_str(value);
                    }
                    out.push_str("?>");
                }
            }
            NodeType::Comment | NodeType::Root => {}
        }
    }

    out.push_str("</");
    out.push_str(&qname);
    out.push('>');
    Ok(())
}

fn qualified(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}:{name}")
    }
}

/// Prefix as written in the source start tag.
fn element_prefix(node: Node<'_, '_>) -> Result<String> {
    let source = node
        .document()
        .input_text()
        .get(node.range())
        .ok_or_else(|| anyhow!("element outside of the source text"))?;
    let qname = source
        .strip_prefix('<')
        .and_then(|tag| {
            tag.split(|c: char| c.is_whitespace() || c == '>' || c == '/')
                .next()
        })
        .ok_or_else(|| anyhow!("cannot read the name of <{}>", node.tag_name().name()))?;
    Ok(qname
        .split_once(':')
        .map(|(prefix, _)| prefix.to_string())
        .unwrap_or_default())
}

fn attribute_prefix(node: Node<'_, '_>, uri: &str) -> Result<String> {
    let mut bound = node
        .namespaces()
        .filter(|ns| ns.uri() == uri)
        .filter_map(|ns| ns.name());
    let prefix = bound
        .next()
        .ok_or_else(|| anyhow!("no prefix bound to {uri}"))?;
    if bound.next().is_some() {
        bail!("more than one prefix bound to {uri}");
    }
    Ok(prefix.to_string())
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}
