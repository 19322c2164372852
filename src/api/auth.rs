//! HMAC request signing for the Backend.AI REST API.

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

/// Everything that goes into one request signature.
#[derive(Debug, Clone)]
pub struct SignInput<'a> {
    pub method: &'a str,
    pub rel_url: &'a str,
    pub date: DateTime<Utc>,
    pub host: &'a str,
    pub content_type: &'a str,
    pub api_version: &'a str,
    pub body: &'a [u8],
}

pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn hmac_bytes(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac key");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub fn sign(creds: &Credentials, input: &SignInput<'_>) -> String {
    let body_hash = hex::encode(Sha256::digest(input.body));
    let sign_str = format!(
        "{}\n{}\n{}\nhost:{}\ncontent-type:{}\nx-backendai-version:{}\n{}",
        input.method.to_ascii_uppercase(),
        input.rel_url,
        format_date(&input.date),
        input.host,
        input.content_type.to_ascii_lowercase(),
        input.api_version,
        body_hash,
    );
    let day = input.date.format("%Y%m%d").to_string();
    let key = hmac_bytes(creds.secret_key.as_bytes(), day.as_bytes());
    let key = hmac_bytes(&key, input.host.as_bytes());
    hex::encode(hmac_bytes(&key, sign_str.as_bytes()))
}

pub fn authorization_header(creds: &Credentials, signature: &str) -> String {
    format!(
        "BackendAI signMethod=HMAC-SHA256, credential={}:{}",
        creds.access_key, signature
    )
}
