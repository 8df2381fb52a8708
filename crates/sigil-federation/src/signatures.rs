//! Signed JSON and federation request authorization.
//!
//! Signed objects carry detached Ed25519 signatures under
//! `signatures.<server_name>.<key_id>`. The signed bytes are the canonical JSON
//! of the object with `signatures` and `unsigned` removed.
//!
//! Server-to-server HTTP requests carry an `X-Matrix` Authorization header:
//!
//! ```text
//! Authorization: X-Matrix origin="hs.example.org",
//!                key="ed25519:0",
//!                sig="<base64 signature>"
//! ```
//!
//! The signed content is the canonical JSON of a request object:
//!
//! ```json
//! {
//!   "method":      "POST",
//!   "uri":         "/_matrix/identity/api/v1/3pid/unbind",
//!   "origin":      "hs.example.org",
//!   "destination": "id.example.org",
//!   "content":     { ... }   // only present for PUT/POST
//! }
//! ```

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::{error::FederationError, key_manager::KeyManager, keys::verify_signature};

// ─── Request authorization ───────────────────────────────────────────────────

/// The signature a server claims to have made over a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedSignature {
    pub origin: String,
    pub key_id: String,
    pub sig: String,
}

impl ClaimedSignature {
    /// Build the `Authorization: X-Matrix …` header value.
    pub fn to_header(&self) -> String {
        format!(
            r#"X-Matrix origin="{}",key="{}",sig="{}""#,
            self.origin, self.key_id, self.sig,
        )
    }

    /// Parse an `X-Matrix` Authorization header. Parameter values may be
    /// quoted or bare; unknown parameters (such as `destination`) are ignored.
    pub fn from_header(header: &str) -> Result<Self, FederationError> {
        let params = header
            .trim()
            .strip_prefix("X-Matrix ")
            .ok_or_else(|| FederationError::MalformedAuthHeader("must start with 'X-Matrix '".into()))?;

        let mut origin = None;
        let mut key = None;
        let mut sig = None;

        for part in params.split(',') {
            let Some((name, value)) = part.trim().split_once('=') else {
                continue;
            };
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value)
                .to_owned();
            match name.trim() {
                "origin" => origin = Some(value),
                "key" => key = Some(value),
                "sig" => sig = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            origin: origin.ok_or_else(|| FederationError::MalformedAuthHeader("missing 'origin'".into()))?,
            key_id: key.ok_or_else(|| FederationError::MalformedAuthHeader("missing 'key'".into()))?,
            sig: sig.ok_or_else(|| FederationError::MalformedAuthHeader("missing 'sig'".into()))?,
        })
    }
}

/// Sign an outbound federation request.
///
/// * `origin`:      this server's name
/// * `destination`: remote server's name
/// * `method`:      HTTP method (e.g. `"POST"`)
/// * `uri`:         request path + query
/// * `content`:     request body (pass `None` for GET requests)
pub fn sign_request(
    keys: &dyn KeyManager,
    origin: &str,
    destination: &str,
    method: &str,
    uri: &str,
    content: Option<&Value>,
) -> Result<ClaimedSignature, FederationError> {
    let canonical = request_signing_object(origin, destination, method, uri, content)?;
    let signature = keys.sign(canonical.as_bytes())?;
    Ok(ClaimedSignature { origin: origin.to_owned(), key_id: signature.key_id, sig: signature.signature })
}

/// The canonical JSON that an `X-Matrix` signature covers.
pub fn request_signing_object(
    origin: &str,
    destination: &str,
    method: &str,
    uri: &str,
    content: Option<&Value>,
) -> Result<String, FederationError> {
    let mut map = Map::new();
    map.insert("method".into(), Value::String(method.to_uppercase()));
    map.insert("uri".into(), Value::String(uri.to_owned()));
    map.insert("origin".into(), Value::String(origin.to_owned()));
    map.insert("destination".into(), Value::String(destination.to_owned()));
    if let Some(body) = content {
        map.insert("content".into(), body.clone());
    }
    canonical_json(&Value::Object(map))
}

// ─── Signed JSON ─────────────────────────────────────────────────────────────

/// Sign a JSON object in place, adding the signature under
/// `signatures.<server_name>.<key_id>`. Existing signatures are kept.
pub fn sign_json(
    keys: &dyn KeyManager,
    server_name: &str,
    value: &mut Value,
) -> Result<(), FederationError> {
    let canonical = canonical_json(&signable(value)?)?;
    let signature = keys.sign(canonical.as_bytes())?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| FederationError::Other(anyhow::anyhow!("signed value must be a JSON object")))?;
    let signatures = object
        .entry("signatures")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(by_server) = signatures else {
        return Err(FederationError::Other(anyhow::anyhow!("'signatures' must be an object")));
    };
    let server_sigs = by_server
        .entry(server_name)
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(server_sigs) = server_sigs else {
        return Err(FederationError::Other(anyhow::anyhow!("signatures of '{server_name}' must be an object")));
    };
    server_sigs.insert(signature.key_id, Value::String(signature.signature));
    Ok(())
}

/// Check that `value` carries at least one valid signature from `server_name`.
///
/// `key_for` maps a key ID to the unpadded base64 public key it names; key IDs
/// it does not recognise are skipped.
pub fn verify_signed_json(
    value: &Value,
    server_name: &str,
    key_for: impl Fn(&str) -> Option<String>,
) -> Result<(), FederationError> {
    let sigs = value
        .get("signatures")
        .and_then(|s| s.get(server_name))
        .and_then(Value::as_object)
        .filter(|sigs| !sigs.is_empty())
        .ok_or_else(|| FederationError::MissingSignature(server_name.to_owned()))?;

    let canonical = canonical_json(&signable(value)?)?;
    let verified = sigs.iter().any(|(key_id, sig)| {
        match (key_for(key_id), sig.as_str()) {
            (Some(key), Some(sig)) => verify_signature(&key, sig, canonical.as_bytes()).is_ok(),
            _ => false,
        }
    });

    if verified { Ok(()) } else { Err(FederationError::InvalidSignature) }
}

/// Strip the parts of a signed object that are not covered by its signatures.
fn signable(value: &Value) -> Result<Value, FederationError> {
    let mut object = value
        .as_object()
        .cloned()
        .ok_or_else(|| FederationError::Other(anyhow::anyhow!("signed value must be a JSON object")))?;
    object.remove("signatures");
    object.remove("unsigned");
    Ok(Value::Object(object))
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
///
/// Follows the Matrix canonical JSON rules: keys sorted lexicographically at
/// every depth, no insignificant whitespace.
pub fn canonical_json(value: &Value) -> Result<String, FederationError> {
    Ok(serde_json::to_string(&sort_keys(value))?)
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_keys(v)))
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect();
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{key_manager::KeySignature, keys::ServerKeyPair};
    use serde_json::json;

    /// In-memory key manager over a single generated key.
    pub(crate) struct StaticKeys(pub ServerKeyPair);

    impl KeyManager for StaticKeys {
        fn sign(&self, payload: &[u8]) -> Result<KeySignature, FederationError> {
            Ok(KeySignature { key_id: self.0.key_id.clone(), signature: self.0.sign_bytes(payload) })
        }

        fn verify(&self, payload: &[u8], signature: &str, key_id: &str) -> bool {
            key_id == self.0.key_id
                && verify_signature(&self.0.public_key_base64(), signature, payload).is_ok()
        }

        fn current_public_key(&self) -> (String, String) {
            (self.0.key_id.clone(), self.0.public_key_base64())
        }
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"d": [ {"z": 0, "y": 1} ], "c": null}});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":{"c":null,"d":[{"y":1,"z":0}]},"b":1}"#
        );
    }

    #[test]
    fn signed_json_verifies_and_detects_tampering() {
        let keys = StaticKeys(ServerKeyPair::generate(0));
        let public = keys.0.public_key_base64();
        let mut value = json!({"mxid": "@a:example.org", "token": "abc"});
        sign_json(&keys, "id.example.org", &mut value).unwrap();

        assert!(value["signatures"]["id.example.org"]["ed25519:0"].is_string());
        verify_signed_json(&value, "id.example.org", |_| Some(public.clone())).unwrap();

        let mut tampered = value.clone();
        tampered["token"] = json!("xyz");
        assert!(matches!(
            verify_signed_json(&tampered, "id.example.org", |_| Some(public.clone())),
            Err(FederationError::InvalidSignature)
        ));
        assert!(matches!(
            verify_signed_json(&value, "other.org", |_| Some(public.clone())),
            Err(FederationError::MissingSignature(_))
        ));
    }

    #[test]
    fn auth_header_round_trips_and_accepts_bare_values() {
        let keys = StaticKeys(ServerKeyPair::generate(0));
        let content = json!({"mxid": "@a:hs.example.org"});
        let auth = sign_request(&keys, "hs.example.org", "id.example.org", "post", "/x", Some(&content))
            .unwrap();
        assert_eq!(ClaimedSignature::from_header(&auth.to_header()).unwrap(), auth);

        let bare = ClaimedSignature::from_header(
            "X-Matrix origin=hs.example.org,destination=id.example.org,key=\"ed25519:0\",sig=abc",
        )
        .unwrap();
        assert_eq!(bare.origin, "hs.example.org");
        assert_eq!(bare.key_id, "ed25519:0");
        assert_eq!(bare.sig, "abc");

        assert!(ClaimedSignature::from_header("Bearer abc").is_err());
        assert!(ClaimedSignature::from_header("X-Matrix origin=a,key=b").is_err());
    }

    #[test]
    fn request_signature_covers_method_and_destination() {
        let keys = StaticKeys(ServerKeyPair::generate(0));
        let auth = sign_request(&keys, "hs.example.org", "id.example.org", "POST", "/x", None).unwrap();

        let same = request_signing_object("hs.example.org", "id.example.org", "POST", "/x", None).unwrap();
        let other = request_signing_object("hs.example.org", "evil.org", "POST", "/x", None).unwrap();
        assert!(keys.verify(same.as_bytes(), &auth.sig, &auth.key_id));
        assert!(!keys.verify(other.as_bytes(), &auth.sig, &auth.key_id));
    }
}
