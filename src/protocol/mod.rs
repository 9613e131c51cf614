//! Order wire codec for the platform's encrypted booking endpoint
//!
//! The platform accepts orders only through an application-layer handshake:
//! the JSON payload is AES-128-ECB encrypted under a fresh random key, and
//! the key plus a millisecond timestamp travel in the `sid`/`tim` headers,
//! each RSA-encrypted against the platform's published public key.
//!
//! ECB mode and PKCS#1 v1.5 are wire requirements of the server, not
//! choices this crate gets to make.

use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use rand::Rng;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use serde::Serialize;
use serde_json::Value;

use crate::config::FailoverConfig;
use crate::models::{OrderResponse, Slot, SubmissionOutcome, Target};
use crate::utils::error::{ApiError, BookingError};

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;

const KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const KEY_LEN: usize = 16;

/// Message fragments the platform uses for business-level rejections
const FAILURE_MARKERS: &[&str] = &["失败", "错误", "超时", "权限", "不存在", "非法"];
const SLOT_GONE_MARKERS: &[&str] = &["已满", "不可用", "已被预订", "库存"];

/// Encrypted request ready for the confirm-order endpoint
#[derive(Debug, Clone)]
pub struct EncodedOrder {
    /// Base64 ciphertext sent as the raw request body
    pub body: String,

    /// RSA-encrypted AES key header
    pub sid: String,

    /// RSA-encrypted request timestamp header
    pub tim: String,
}

/// One sub-site line inside the order payload.
///
/// Field names and the fixed literals are wire-exact; the server rejects
/// anything else.
#[derive(Debug, Clone, Serialize)]
pub struct SpaceOrder {
    #[serde(rename = "venuePrice")]
    pub venue_price: String,
    pub count: u32,
    pub sign: String,
    pub status: u32,
    #[serde(rename = "scheduleTime")]
    pub schedule_time: String,
    #[serde(rename = "subSitename")]
    pub sub_sitename: String,
    #[serde(rename = "subSiteId")]
    pub sub_site_id: String,
    pub tensity: String,
    #[serde(rename = "venueNum")]
    pub venue_num: u32,
}

/// Full order payload for the confirm-order endpoint
#[derive(Debug, Clone, Serialize)]
pub struct OrderPayload {
    #[serde(rename = "venTypeId")]
    pub ven_type_id: String,
    #[serde(rename = "venueId")]
    pub venue_id: String,
    #[serde(rename = "fieldType")]
    pub field_type: String,
    #[serde(rename = "returnUrl")]
    pub return_url: String,
    #[serde(rename = "scheduleDate")]
    pub schedule_date: String,
    pub week: String,
    pub spaces: Vec<SpaceOrder>,
    #[serde(rename = "tenSity")]
    pub ten_sity: String,
}

impl OrderPayload {
    /// Build the payload for one slot.
    ///
    /// The caller is responsible for the sign's freshness; this function
    /// rejects signless slots outright.
    pub fn for_slot(slot: &Slot, target: &Target, return_url: &str) -> Result<Self, BookingError> {
        let sign = slot
            .sign
            .clone()
            .ok_or_else(|| BookingError::SlotGone("slot carries no sign".into()))?;

        Ok(Self {
            ven_type_id: target.field_type_id.clone(),
            venue_id: target.venue_id.clone(),
            field_type: target.field_type_name.clone().unwrap_or_default(),
            return_url: return_url.to_string(),
            schedule_date: slot.date.format("%Y-%m-%d").to_string(),
            week: "0".to_string(),
            spaces: vec![SpaceOrder {
                venue_price: format!("{}", slot.price.unwrap_or(0.0) as i64),
                count: 1,
                sign,
                status: 1,
                schedule_time: slot.schedule_time(),
                sub_sitename: slot.sub_site_name.clone(),
                sub_site_id: slot.sub_site_id.clone(),
                tensity: "1".to_string(),
                venue_num: 1,
            }],
            ten_sity: "紧张".to_string(),
        })
    }
}

/// Codec holding the platform's RSA public key
#[derive(Debug)]
pub struct OrderCodec {
    public_key: RsaPublicKey,
}

impl OrderCodec {
    /// Create a codec from a PEM public key.
    ///
    /// # Errors
    ///
    /// Returns `BookingError::Config` when the PEM is malformed; a rotated
    /// or missing key is a deployment problem, never retried.
    pub fn new(pem: &str) -> Result<Self, BookingError> {
        let public_key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| BookingError::Config(format!("invalid RSA public key: {e}")))?;
        Ok(Self { public_key })
    }

    /// Generate a fresh 16-character AES key from `[A-Z0-9]`
    pub fn generate_key() -> String {
        let mut rng = rand::thread_rng();
        (0..KEY_LEN)
            .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
            .collect()
    }

    /// Encode an order payload for submission.
    ///
    /// A fresh key and timestamp are generated per call; encoded orders are
    /// never reused across attempts.
    pub fn encode(&self, payload: &OrderPayload) -> Result<EncodedOrder, BookingError> {
        self.encode_at(payload, Utc::now().timestamp_millis())
    }

    /// Encode with an explicit timestamp (exposed for tests)
    pub fn encode_at(
        &self,
        payload: &OrderPayload,
        timestamp_millis: i64,
    ) -> Result<EncodedOrder, BookingError> {
        let key = Self::generate_key();
        let plain = serde_json::to_string(payload)
            .map_err(|e| BookingError::Crypto(format!("payload serialization failed: {e}")))?;

        let body = aes_encrypt(&key, &plain)?;
        let sid = self.rsa_encrypt(key.as_bytes())?;
        let tim = self.rsa_encrypt(timestamp_millis.to_string().as_bytes())?;

        Ok(EncodedOrder { body, sid, tim })
    }

    fn rsa_encrypt(&self, data: &[u8]) -> Result<String, BookingError> {
        let mut rng = rand::thread_rng();
        let ciphertext = self
            .public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, data)
            .map_err(|e| BookingError::Crypto(format!("RSA encryption failed: {e}")))?;
        Ok(BASE64.encode(ciphertext))
    }
}

/// AES-128-ECB + PKCS#7 encrypt, base64-encoded
pub fn aes_encrypt(key: &str, plaintext: &str) -> Result<String, BookingError> {
    let cipher = Aes128EcbEnc::new_from_slice(key.as_bytes())
        .map_err(|_| BookingError::Crypto(format!("AES key must be 16 bytes, got {}", key.len())))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(BASE64.encode(ciphertext))
}

/// Inverse of [`aes_encrypt`]; the platform never sends encrypted bodies
/// back, but round-tripping keeps the codec honest under test
pub fn aes_decrypt(key: &str, encoded: &str) -> Result<String, BookingError> {
    let ciphertext = BASE64
        .decode(encoded)
        .map_err(|e| BookingError::Crypto(format!("base64 decode failed: {e}")))?;
    let cipher = Aes128EcbDec::new_from_slice(key.as_bytes())
        .map_err(|_| BookingError::Crypto(format!("AES key must be 16 bytes, got {}", key.len())))?;
    let plain = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|e| BookingError::Crypto(format!("AES decryption failed: {e}")))?;
    String::from_utf8(plain).map_err(|e| BookingError::Crypto(format!("invalid UTF-8: {e}")))
}

/// Decode an order endpoint response body
pub fn decode_response(body: &str) -> Result<OrderResponse, ApiError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ApiError::Decode(format!("order response is not JSON: {e}")))?;

    let code = match value.get("code") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    let msg = value
        .get("msg")
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let order_id = ["orderId", "order_id", "id", "data"]
        .iter()
        .find_map(|k| match value.get(*k) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        });

    Ok(OrderResponse {
        code,
        msg,
        order_id,
    })
}

/// Classifier mapping decoded responses to submission outcomes.
///
/// Which codes and message fragments mean "rate limited" is configuration:
/// the platform signals throttling through ordinary 500s with a message, so
/// the mapping must stay tunable.
#[derive(Debug, Clone)]
pub struct OutcomeClassifier {
    rate_limit_codes: Vec<i64>,
    rate_limit_patterns: Vec<String>,
}

impl OutcomeClassifier {
    pub fn new(config: &FailoverConfig) -> Self {
        Self {
            rate_limit_codes: config.rate_limit_codes.clone(),
            rate_limit_patterns: config.rate_limit_patterns.clone(),
        }
    }

    /// Classify an HTTP status before the body is even consulted
    pub fn classify_status(&self, status: u16) -> Option<SubmissionOutcome> {
        match status {
            401 | 403 => Some(SubmissionOutcome::AuthExpired),
            429 => Some(SubmissionOutcome::RateLimited),
            _ => None,
        }
    }

    /// Classify a decoded order response
    pub fn classify(&self, response: &OrderResponse) -> SubmissionOutcome {
        let msg_lower = response.msg.to_lowercase();

        if let Some(code) = response.code {
            if code == 401 || code == 403 {
                return SubmissionOutcome::AuthExpired;
            }
            if self.rate_limit_codes.contains(&code)
                && self
                    .rate_limit_patterns
                    .iter()
                    .any(|p| msg_lower.contains(&p.to_lowercase()))
            {
                return SubmissionOutcome::RateLimited;
            }
            if code != 0 {
                if SLOT_GONE_MARKERS.iter().any(|m| response.msg.contains(m)) {
                    return SubmissionOutcome::SlotGone;
                }
                if self.rate_limit_codes.contains(&code) {
                    // Bare 500 with no throttling message: a server fault,
                    // still worth rotating off this account.
                    return SubmissionOutcome::RateLimited;
                }
                return SubmissionOutcome::Fatal(format!("code {code}: {}", response.msg));
            }
        }

        if SLOT_GONE_MARKERS.iter().any(|m| response.msg.contains(m)) {
            return SubmissionOutcome::SlotGone;
        }
        if FAILURE_MARKERS.iter().any(|m| response.msg.contains(m)) {
            return SubmissionOutcome::Fatal(response.msg.clone());
        }

        match &response.order_id {
            Some(order_id) => SubmissionOutcome::Success {
                order_id: order_id.clone(),
            },
            None => SubmissionOutcome::Fatal("no order id in response".into()),
        }
    }
}
