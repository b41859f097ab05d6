//! NTLMv2 client messages (MS-NLMP).
//!
//! Only what an HTTP client needs: the NEGOTIATE message, parsing of the
//! server CHALLENGE, and the AUTHENTICATE message with an NTLMv2 response.
//! No signing or sealing keys are derived.

use super::{Challenge, Handshake, NtlmCredentials, authorization_value, parse_challenge};
use crate::error::ClientError;
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderValue};
use md4::{Digest, Md4};
use md5::Md5;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacMd5 = Hmac<Md5>;

const SCHEME: &str = "NTLM";
const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const NEGOTIATE_FLAGS: u32 = NEGOTIATE_UNICODE
    | NEGOTIATE_OEM
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_TARGET_INFO
    | NEGOTIATE_128
    | NEGOTIATE_56;

const MSV_AV_EOL: u16 = 0x0000;
const MSV_AV_TIMESTAMP: u16 = 0x0007;

/// 100ns intervals between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_OFFSET: u64 = 116_444_736_000_000_000;

const AUTHENTICATE_HEADER_LEN: usize = 64;

fn malformed(reason: &str) -> ClientError {
    ClientError::auth(SCHEME, format!("malformed challenge message: {reason}"))
}

fn utf16le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// NEGOTIATE_MESSAGE (type 1) with empty domain and workstation.
pub(crate) fn negotiate_message() -> Vec<u8> {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    // domain and workstation security buffers
    msg.extend_from_slice(&[0u8; 16]);
    msg
}

/// Parsed CHALLENGE_MESSAGE (type 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChallengeMessage {
    pub(crate) flags: u32,
    pub(crate) server_challenge: [u8; 8],
    pub(crate) target_info: Vec<u8>,
}

impl ChallengeMessage {
    pub(crate) fn parse(bytes: &[u8]) -> Result<Self, ClientError> {
        if bytes.len() < 32 || &bytes[..8] != SIGNATURE {
            return Err(malformed("missing NTLMSSP signature"));
        }
        if read_u32(bytes, 8) != Some(2) {
            return Err(malformed("not a type 2 message"));
        }
        let flags = read_u32(bytes, 20).ok_or_else(|| malformed("truncated flags"))?;
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&bytes[24..32]);

        let target_info = if bytes.len() >= 48 {
            let len = usize::from(read_u16(bytes, 40).unwrap_or_default());
            let offset = read_u32(bytes, 44)
                .and_then(|o| usize::try_from(o).ok())
                .unwrap_or_default();
            bytes
                .get(offset..offset + len)
                .ok_or_else(|| malformed("target info out of bounds"))?
                .to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            flags,
            server_challenge,
            target_info,
        })
    }

    /// `MsvAvTimestamp` from the target info, if the server sent one.
    pub(crate) fn timestamp(&self) -> Option<[u8; 8]> {
        let info = &self.target_info;
        let mut at = 0;
        while let (Some(id), Some(len)) = (read_u16(info, at), read_u16(info, at + 2)) {
            let len = usize::from(len);
            let value = info.get(at + 4..at + 4 + len)?;
            match id {
                MSV_AV_EOL => return None,
                MSV_AV_TIMESTAMP if len == 8 => {
                    let mut stamp = [0u8; 8];
                    stamp.copy_from_slice(value);
                    return Some(stamp);
                }
                _ => at += 4 + len,
            }
        }
        None
    }
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16], ClientError> {
    let mut mac = HmacMd5::new_from_slice(key)
        .map_err(|_| ClientError::auth(SCHEME, "invalid HMAC key length"))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// NTOWFv1: MD4 of the UTF-16LE password.
fn nt_hash(password: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md4::digest(utf16le(password)));
    out
}

/// NTOWFv2: HMAC-MD5 keyed with the NT hash over UPPER(user) + domain.
fn ntowf_v2(credentials: &NtlmCredentials) -> Result<[u8; 16], ClientError> {
    let hash = nt_hash(credentials.password.expose());
    let identity = utf16le(&format!(
        "{}{}",
        credentials.username.to_uppercase(),
        credentials.domain
    ));
    hmac_md5(&hash, &[&identity])
}

fn lmv2_response(
    response_key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> Result<Vec<u8>, ClientError> {
    let mut response = hmac_md5(response_key, &[server_challenge, client_challenge])?.to_vec();
    response.extend_from_slice(client_challenge);
    Ok(response)
}

fn ntlmv2_response(
    response_key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: &[u8; 8],
    target_info: &[u8],
) -> Result<Vec<u8>, ClientError> {
    let mut temp = Vec::with_capacity(32 + target_info.len());
    temp.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
    temp.extend_from_slice(timestamp);
    temp.extend_from_slice(client_challenge);
    temp.extend_from_slice(&[0u8; 4]);
    temp.extend_from_slice(target_info);
    temp.extend_from_slice(&[0u8; 4]);

    let proof = hmac_md5(response_key, &[server_challenge, &temp])?;
    let mut response = proof.to_vec();
    response.extend_from_slice(&temp);
    Ok(response)
}

fn filetime_now() -> [u8; 8] {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let intervals = u64::try_from(since_epoch.as_nanos().div_euclid(100)).unwrap_or(u64::MAX);
    intervals.saturating_add(FILETIME_UNIX_OFFSET).to_le_bytes()
}

/// AUTHENTICATE_MESSAGE (type 3) answering `challenge`.
pub(crate) fn authenticate_message(
    credentials: &NtlmCredentials,
    challenge: &ChallengeMessage,
    client_challenge: [u8; 8],
) -> Result<Vec<u8>, ClientError> {
    let response_key = ntowf_v2(credentials)?;
    let server_timestamp = challenge.timestamp();
    let timestamp = server_timestamp.unwrap_or_else(filetime_now);

    // With a server timestamp the LM response must be Z(24).
    let lm = match server_timestamp {
        Some(_) => vec![0u8; 24],
        None => lmv2_response(&response_key, &challenge.server_challenge, &client_challenge)?,
    };
    let nt = ntlmv2_response(
        &response_key,
        &challenge.server_challenge,
        &client_challenge,
        &timestamp,
        &challenge.target_info,
    )?;
    let domain = utf16le(&credentials.domain);
    let user = utf16le(&credentials.username);
    let workstation = Vec::new();
    let session_key = Vec::new();

    // Header order: LM, NT, domain, user, workstation, session key.
    let fields: [&[u8]; 6] = [&lm, &nt, &domain, &user, &workstation, &session_key];

    let mut header = Vec::with_capacity(AUTHENTICATE_HEADER_LEN);
    header.extend_from_slice(SIGNATURE);
    header.extend_from_slice(&3u32.to_le_bytes());
    let mut payload = Vec::new();
    for field in fields {
        let len = u16::try_from(field.len())
            .map_err(|_| ClientError::auth(SCHEME, "authenticate field too long"))?;
        let offset = u32::try_from(AUTHENTICATE_HEADER_LEN + payload.len())
            .map_err(|_| ClientError::auth(SCHEME, "authenticate message too long"))?;
        header.extend_from_slice(&len.to_le_bytes());
        header.extend_from_slice(&len.to_le_bytes());
        header.extend_from_slice(&offset.to_le_bytes());
        payload.extend_from_slice(field);
    }
    header.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    header.extend_from_slice(&payload);
    Ok(header)
}

/// Two-leg NTLM exchange for one hop.
pub(crate) struct NtlmHandshake {
    credentials: NtlmCredentials,
    authenticated: bool,
}

impl NtlmHandshake {
    pub(crate) fn new(credentials: NtlmCredentials) -> Self {
        Self {
            credentials,
            authenticated: false,
        }
    }
}

impl Handshake for NtlmHandshake {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    fn initial(&mut self) -> Result<Option<HeaderValue>, ClientError> {
        authorization_value(SCHEME, &negotiate_message()).map(Some)
    }

    fn respond(&mut self, headers: &HeaderMap) -> Result<Option<HeaderValue>, ClientError> {
        if self.authenticated {
            return Ok(None);
        }
        match parse_challenge(headers, SCHEME)? {
            Challenge::Token(token) => {
                let challenge = ChallengeMessage::parse(&token)?;
                tracing::trace!(flags = challenge.flags, "received NTLM challenge");
                let message =
                    authenticate_message(&self.credentials, &challenge, rand::random())?;
                self.authenticated = true;
                authorization_value(SCHEME, &message).map(Some)
            }
            Challenge::Offered => {
                tracing::debug!("server rejected NTLM negotiate message");
                Ok(None)
            }
            Challenge::Absent => Ok(None),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::secret::Password;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use http::header::WWW_AUTHENTICATE;

    const SERVER_CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
    const CLIENT_CHALLENGE: [u8; 8] = [0xaa; 8];

    fn credentials() -> NtlmCredentials {
        NtlmCredentials {
            domain: "Domain".to_owned(),
            username: "User".to_owned(),
            password: Password::new("Password"),
        }
    }

    /// `MsvAvNbDomainName` = "Domain", `MsvAvNbComputerName` = "Server", EOL.
    fn target_info() -> Vec<u8> {
        let mut info = Vec::new();
        for (id, value) in [(2u16, "Domain"), (1u16, "Server")] {
            let value = utf16le(value);
            info.extend_from_slice(&id.to_le_bytes());
            info.extend_from_slice(&u16::try_from(value.len()).unwrap().to_le_bytes());
            info.extend_from_slice(&value);
        }
        info.extend_from_slice(&[0u8; 4]);
        info
    }

    fn challenge_bytes(target_info: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&2u32.to_le_bytes());
        // target name: empty, offset 48
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&48u32.to_le_bytes());
        msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
        msg.extend_from_slice(&SERVER_CHALLENGE);
        msg.extend_from_slice(&[0u8; 8]);
        let len = u16::try_from(target_info.len()).unwrap();
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&48u32.to_le_bytes());
        msg.extend_from_slice(target_info);
        msg
    }

    #[test]
    fn test_nt_hash_vector() {
        assert_eq!(
            hex::encode(nt_hash("Password")),
            "a4f49c406510bdcab6824ee7c30fd852"
        );
    }

    #[test]
    fn test_ntowf_v2_vector() {
        assert_eq!(
            hex::encode(ntowf_v2(&credentials()).unwrap()),
            "0c868a403bfd7a93a3001ef22ef02e3f"
        );
    }

    #[test]
    fn test_lmv2_response_vector() {
        let key = ntowf_v2(&credentials()).unwrap();
        let lm = lmv2_response(&key, &SERVER_CHALLENGE, &CLIENT_CHALLENGE).unwrap();
        assert_eq!(
            hex::encode(lm),
            "86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa"
        );
    }

    #[test]
    fn test_ntlmv2_proof_vector() {
        let key = ntowf_v2(&credentials()).unwrap();
        let nt = ntlmv2_response(
            &key,
            &SERVER_CHALLENGE,
            &CLIENT_CHALLENGE,
            &[0u8; 8],
            &target_info(),
        )
        .unwrap();
        assert_eq!(hex::encode(&nt[..16]), "68cd0ab851e51c96aabc927bebef6a1c");
        assert_eq!(&nt[16..24], &[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(nt.len(), 16 + 32 + target_info().len());
    }

    #[test]
    fn test_negotiate_message_layout() {
        let msg = negotiate_message();
        assert_eq!(msg.len(), 32);
        assert_eq!(&msg[..8], SIGNATURE);
        assert_eq!(read_u32(&msg, 8), Some(1));
        assert_eq!(read_u32(&msg, 12), Some(0xa088_8207));
    }

    #[test]
    fn test_parse_challenge_message() {
        let parsed = ChallengeMessage::parse(&challenge_bytes(&target_info())).unwrap();
        assert_eq!(parsed.server_challenge, SERVER_CHALLENGE);
        assert_eq!(parsed.flags, NEGOTIATE_FLAGS);
        assert_eq!(parsed.target_info, target_info());
        assert_eq!(parsed.timestamp(), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ChallengeMessage::parse(b"not ntlm at all").is_err());

        let mut wrong_type = challenge_bytes(&[]);
        wrong_type[8] = 3;
        assert!(ChallengeMessage::parse(&wrong_type).is_err());

        let mut truncated = challenge_bytes(&target_info());
        truncated.truncate(60);
        assert!(ChallengeMessage::parse(&truncated).is_err());
    }

    #[test]
    fn test_timestamp_forces_zero_lm_response() {
        let mut info = Vec::new();
        info.extend_from_slice(&MSV_AV_TIMESTAMP.to_le_bytes());
        info.extend_from_slice(&8u16.to_le_bytes());
        info.extend_from_slice(&[7u8; 8]);
        info.extend_from_slice(&[0u8; 4]);
        let challenge = ChallengeMessage::parse(&challenge_bytes(&info)).unwrap();
        assert_eq!(challenge.timestamp(), Some([7u8; 8]));

        let msg = authenticate_message(&credentials(), &challenge, CLIENT_CHALLENGE).unwrap();
        let lm_len = usize::from(read_u16(&msg, 12).unwrap());
        let lm_offset = usize::try_from(read_u32(&msg, 16).unwrap()).unwrap();
        assert_eq!(lm_len, 24);
        assert_eq!(&msg[lm_offset..lm_offset + 24], &[0u8; 24]);
    }

    #[test]
    fn test_authenticate_message_fields() {
        let challenge = ChallengeMessage::parse(&challenge_bytes(&target_info())).unwrap();
        let msg = authenticate_message(&credentials(), &challenge, CLIENT_CHALLENGE).unwrap();

        assert_eq!(&msg[..8], SIGNATURE);
        assert_eq!(read_u32(&msg, 8), Some(3));
        assert_eq!(read_u32(&msg, 60), Some(NEGOTIATE_FLAGS));

        let field = |at: usize| {
            let len = usize::from(read_u16(&msg, at).unwrap());
            let offset = usize::try_from(read_u32(&msg, at + 4).unwrap()).unwrap();
            msg[offset..offset + len].to_vec()
        };
        assert_eq!(field(28), utf16le("Domain"));
        assert_eq!(field(36), utf16le("User"));
        assert!(field(44).is_empty());
        assert_eq!(
            hex::encode(field(12)),
            "86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa"
        );
        assert_eq!(field(20).len(), 16 + 32 + target_info().len());
    }

    #[test]
    fn test_handshake_legs() {
        let mut handshake = NtlmHandshake::new(credentials());
        let first = handshake.initial().unwrap().unwrap();
        let first = first.to_str().unwrap();
        assert!(first.starts_with("NTLM "));
        let decoded = BASE64.decode(&first[5..]).unwrap();
        assert_eq!(decoded, negotiate_message());

        let mut headers = HeaderMap::new();
        let token = BASE64.encode(challenge_bytes(&target_info()));
        headers.insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_str(&format!("NTLM {token}")).unwrap(),
        );
        let second = handshake.respond(&headers).unwrap().unwrap();
        assert!(second.is_sensitive());
        let decoded = BASE64
            .decode(&second.to_str().unwrap()[5..])
            .unwrap();
        assert_eq!(read_u32(&decoded, 8), Some(3));

        // a second challenge on the same hop is not answered
        assert!(handshake.respond(&headers).unwrap().is_none());
    }

    #[test]
    fn test_handshake_gives_up_when_rejected() {
        let mut handshake = NtlmHandshake::new(credentials());
        let mut headers = HeaderMap::new();
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("NTLM"));
        assert!(handshake.respond(&headers).unwrap().is_none());
    }
}
