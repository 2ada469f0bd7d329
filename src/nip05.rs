//! NIP-05: mapping nostr keys to DNS-based internet identifiers
//!
//! used to resolve human-readable identifiers (`name@domain` or bare
//! `domain`) into public keys, including the remote-signer entries some
//! domains publish under the `nip46` key.

use crate::{PubKey, Result};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// well-known response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellKnownResponse {
    pub names: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relays: Option<HashMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip46: Option<HashMap<String, Vec<String>>>,
}

/// a resolved identifier: the public key plus any relay hints
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIdentifier {
    pub pubkey: PubKey,
    pub relays: Vec<String>,
}

lazy_static::lazy_static! {
    static ref NIP05_REGEX: Regex = Regex::new(r"^(?:([\w.+-]+)@)?([\w_-]+(\.[\w_-]+)+)$").unwrap();
}

/// check if an identifier is valid according to NIP-05 format
pub fn is_valid_identifier(input: &str) -> bool {
    NIP05_REGEX.is_match(input)
}

/// parse a NIP-05 identifier into name and domain parts
pub fn parse_identifier(fullname: &str) -> Result<(String, String)> {
    let captures = NIP05_REGEX.captures(fullname).ok_or("invalid identifier")?;

    let name = captures
        .get(1)
        .map(|m| m.as_str())
        .unwrap_or("_")
        .to_string();
    let domain = captures
        .get(2)
        .ok_or("missing domain")?
        .as_str()
        .to_string();

    Ok((name, domain))
}

/// query a NIP-05 identifier and return the resolved public key with relay hints
pub async fn query_identifier(fullname: &str) -> Result<ResolvedIdentifier> {
    let (result, name) = fetch(fullname).await?;

    let pubkey_hex = result
        .names
        .get(&name)
        .ok_or_else(|| format!("no entry for name '{}'", name))?;

    let pubkey = PubKey::parse(pubkey_hex)
        .map_err(|_| format!("got an invalid public key '{}'", pubkey_hex))?;

    // prefer remote-signer relay hints when the domain publishes them
    let relays = result
        .nip46
        .as_ref()
        .and_then(|m| m.get(pubkey_hex).cloned())
        .or_else(|| {
            result
                .relays
                .as_ref()
                .and_then(|m| m.get(pubkey_hex).cloned())
        })
        .unwrap_or_default();

    Ok(ResolvedIdentifier { pubkey, relays })
}

/// fetch the well-known response for a NIP-05 identifier
pub async fn fetch(fullname: &str) -> Result<(WellKnownResponse, String)> {
    let (name, domain) = parse_identifier(fullname)?;

    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let url = format!("https://{}/.well-known/nostr.json?name={}", domain, name);

    let response = client.get(&url).send().await?;

    if !response.status().is_success() {
        return Err(format!("HTTP error: {}", response.status()).into());
    }

    let result: WellKnownResponse = response.json().await?;

    Ok((result, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let test_cases = vec![
            ("saknd@yyq.com", "saknd", "yyq.com", false),
            ("asdn.com", "_", "asdn.com", false),
            ("_@uxux.com.br", "_", "uxux.com.br", false),
            ("821yh498ig21", "", "", true),
            ("////", "", "", true),
        ];

        for (input, expected_name, expected_domain, expect_error) in test_cases {
            match parse_identifier(input) {
                Ok((name, domain)) => {
                    assert!(!expect_error, "expected error for input: {}", input);
                    assert_eq!(name, expected_name);
                    assert_eq!(domain, expected_domain);
                }
                Err(_) => {
                    assert!(expect_error, "did not expect error for input: {}", input);
                }
            }
        }
    }

    #[test]
    fn test_nip46_relays_preferred() {
        let pk_hex = "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d";
        let response: WellKnownResponse = serde_json::from_str(&format!(
            r#"{{
                "names": {{"bob": "{pk_hex}"}},
                "relays": {{"{pk_hex}": ["wss://general.example.com"]}},
                "nip46": {{"{pk_hex}": ["wss://signer.example.com"]}}
            }}"#
        ))
        .unwrap();

        let relays = response
            .nip46
            .as_ref()
            .and_then(|m| m.get(pk_hex).cloned())
            .unwrap();
        assert_eq!(relays, vec!["wss://signer.example.com".to_string()]);
    }
}
