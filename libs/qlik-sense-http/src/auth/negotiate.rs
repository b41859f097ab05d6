//! Platform Negotiate tokens through the system Kerberos stack.
//!
//! GSSAPI on Unix and SSPI on Windows, both reached through `cross-krb5`.
//! Credentials are those of the calling process (ticket cache or logon session).

use super::{Negotiation, SecurityContext};
use crate::error::ClientError;
use cross_krb5::{ClientCtx, InitiateFlags, PendingClientCtx, Step};

const SCHEME: &str = "Negotiate";

/// [`SecurityContext`] backed by the operating system's Kerberos/SPNEGO provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformContext;

impl SecurityContext for PlatformContext {
    fn begin(&self, service_principal: &str) -> Result<Box<dyn Negotiation>, ClientError> {
        let (pending, token) =
            ClientCtx::new(InitiateFlags::NEGOTIATE_TOKEN, None, service_principal, None)
                .map_err(|e| ClientError::auth(SCHEME, format!("{e:#}")))?;
        tracing::debug!(principal = service_principal, "negotiate context started");
        Ok(Box::new(PlatformNegotiation::Started {
            pending,
            token: token.to_vec(),
        }))
    }
}

enum PlatformNegotiation {
    /// First token produced, not yet handed out
    Started {
        pending: PendingClientCtx,
        token: Vec<u8>,
    },
    /// Waiting for the server's answer
    Pending(PendingClientCtx),
    Done,
}

impl Negotiation for PlatformNegotiation {
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, ClientError> {
        match (std::mem::replace(self, Self::Done), challenge) {
            (Self::Started { pending, token }, None) => {
                *self = Self::Pending(pending);
                Ok(Some(token))
            }
            (Self::Started { pending, .. } | Self::Pending(pending), Some(challenge)) => {
                match pending
                    .step(challenge)
                    .map_err(|e| ClientError::auth(SCHEME, format!("{e:#}")))?
                {
                    Step::Finished((_ctx, token)) => Ok(token.map(|t| t.to_vec())),
                    Step::Continue((pending, token)) => {
                        *self = Self::Pending(pending);
                        Ok(Some(token.to_vec()))
                    }
                }
            }
            (Self::Pending(pending), None) => {
                *self = Self::Pending(pending);
                Ok(None)
            }
            (Self::Done, _) => Ok(None),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_principal_is_auth_error() {
        // no realm or ticket cache is configured on build machines
        let result = PlatformContext.begin("HTTP/qlik.invalid");
        if let Err(err) = result {
            assert!(matches!(err, ClientError::Auth { scheme: "Negotiate", .. }));
        }
    }

    #[test]
    fn test_finished_negotiation_yields_nothing() {
        let mut negotiation = PlatformNegotiation::Done;
        assert!(negotiation.step(None).unwrap().is_none());
        assert!(negotiation.step(Some(b"server")).unwrap().is_none());
    }
}
