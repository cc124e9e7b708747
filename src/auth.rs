//! Challenge-response authentication on the auth endpoint.
//!
//! ```text
//! host  -> 02 00                      request random
//! watch -> 10 02 01 <nonce:16>        challenge
//! host  -> 03 00 <AES-128(nonce):16>  response
//! watch -> 10 03 01                   accepted
//! ```

use aes::{
    cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
    Aes128,
};
use futures::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    error::{AuthFailure, BipError, Result},
    protocol::{auth_response, AuthFrame, AUTH_REQUEST_RANDOM, NONCE_LEN},
    transport::{CommandWriter, EventSink},
    types::{Credential, Endpoint, HandshakeState, SyncEvent, WriteMode},
};

/// Encrypt one 16-byte nonce with the shared key (single AES block, no chaining)
#[must_use]
pub fn encrypt_nonce(credential: &Credential, nonce: &[u8; NONCE_LEN]) -> [u8; NONCE_LEN] {
    let cipher = Aes128::new(GenericArray::from_slice(credential.as_bytes()));
    let mut block = GenericArray::clone_from_slice(nonce);
    cipher.encrypt_block(&mut block);

    let mut ciphertext = [0u8; NONCE_LEN];
    ciphertext.copy_from_slice(&block);
    ciphertext
}

/// One authentication attempt on one connection
///
/// The handshake is single-use: once it reaches a terminal state a new
/// instance is needed for the next attempt.
pub struct AuthHandshake {
    writer: Arc<CommandWriter>,
    timeout: Duration,
    events: EventSink,
    state: HandshakeState,
}

impl AuthHandshake {
    /// Create a handshake over a command writer
    #[must_use]
    pub fn new(writer: Arc<CommandWriter>, timeout: Duration) -> Self {
        Self {
            writer,
            timeout,
            events: EventSink::disabled(),
            state: HandshakeState::Idle,
        }
    }

    /// Report failures to an event sink
    #[must_use]
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the handshake
    ///
    /// # Errors
    ///
    /// - [`BipError::MissingEndpoint`] if the watch exposes no auth endpoint
    /// - [`BipError::AuthenticationFailed`] if the watch rejects the key
    /// - [`BipError::Timeout`] if no verdict arrives in time
    /// - [`BipError::HandshakeFinished`] if this instance was already used
    pub async fn authenticate(&mut self, credential: &Credential) -> Result<()> {
        if self.state != HandshakeState::Idle {
            return Err(BipError::HandshakeFinished);
        }

        let transport = self.writer.transport().clone();
        if let Err(e) = transport.endpoints().require(Endpoint::Auth) {
            return self.fail(e);
        }

        info!("Authenticating...");
        if let Err(e) = transport.subscribe(Endpoint::Auth).await {
            return self.fail(e);
        }
        let mut notifications = match transport.notifications().await {
            Ok(stream) => stream,
            Err(e) => return self.fail(e),
        };

        if let Err(e) = self
            .writer
            .write_once(Endpoint::Auth, &AUTH_REQUEST_RANDOM, WriteMode::WithResponse)
            .await
        {
            return self.fail(e);
        }
        self.state = HandshakeState::ChallengeAwaited;

        let deadline = Instant::now() + self.timeout;
        loop {
            let notification = match tokio::time::timeout_at(deadline, notifications.next()).await
            {
                Ok(Some(notification)) => notification,
                Ok(None) => return self.fail(BipError::Disconnected),
                Err(_) => {
                    return self.fail(BipError::Timeout {
                        operation: "handshake",
                        timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            };
            if notification.endpoint != Endpoint::Auth {
                continue;
            }

            debug!("Auth <- {:02X?}", notification.value.as_ref());
            match AuthFrame::parse(&notification.value) {
                Some(AuthFrame::Challenge(nonce)) => {
                    let ciphertext = encrypt_nonce(credential, &nonce);
                    if let Err(e) = self
                        .writer
                        .write_once(
                            Endpoint::Auth,
                            &auth_response(&ciphertext),
                            WriteMode::WithResponse,
                        )
                        .await
                    {
                        return self.fail(e);
                    }
                    self.state = HandshakeState::ResponseSent;
                }
                Some(AuthFrame::Accepted) if self.state == HandshakeState::ResponseSent => {
                    self.state = HandshakeState::Authenticated;
                    info!("Authenticated");
                    return Ok(());
                }
                Some(AuthFrame::Accepted) => {
                    warn!("Ignoring acceptance before a response was sent");
                }
                Some(AuthFrame::Rejected { opcode, status }) => {
                    return self.fail(BipError::AuthenticationFailed(AuthFailure::from_status(
                        opcode, status,
                    )));
                }
                Some(AuthFrame::MalformedChallenge) => {
                    return self.fail(BipError::AuthenticationFailed(
                        AuthFailure::MalformedChallenge,
                    ));
                }
                None => debug!("Ignoring unrelated auth frame"),
            }
        }
    }

    fn fail(&mut self, err: BipError) -> Result<()> {
        self.state = HandshakeState::Failed;
        error!("Authentication failed: {}", err);
        self.events.emit(SyncEvent::Failed {
            reason: err.to_string(),
        });
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{mock::MockTransport, EndpointSet, Notification};
    use crate::types::{RetryPolicy, WriteCapabilities};
    use tokio_test::assert_ok;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f";
    const NONCE: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
        0xFF,
    ];

    fn handshake(transport: &Arc<MockTransport>) -> AuthHandshake {
        let writer = Arc::new(CommandWriter::new(transport.clone(), RetryPolicy::default()));
        AuthHandshake::new(writer, Duration::from_secs(10))
    }

    fn challenge() -> Vec<u8> {
        let mut frame = vec![0x10, 0x02, 0x01];
        frame.extend_from_slice(&NONCE);
        frame
    }

    #[test]
    fn test_single_block_encryption_vector() {
        let credential = Credential::from_hex(KEY).unwrap();
        assert_eq!(
            hex::encode(encrypt_nonce(&credential, &NONCE)),
            "69c4e0d86a7b0430d8cdb78070b4c55a"
        );
    }

    #[tokio::test]
    async fn test_handshake_reaches_authenticated() {
        let transport = Arc::new(MockTransport::watch());
        let credential = Credential::from_hex(KEY).unwrap();
        let expected = auth_response(&encrypt_nonce(&credential, &NONCE)).to_vec();

        transport.respond_with(move |endpoint, data| {
            assert_eq!(endpoint, Endpoint::Auth);
            match data {
                [0x02, 0x00] => vec![Notification::new(Endpoint::Auth, challenge())],
                response if response == expected.as_slice() => {
                    vec![Notification::new(Endpoint::Auth, vec![0x10, 0x03, 0x01])]
                }
                _ => vec![Notification::new(Endpoint::Auth, vec![0x10, 0x03, 0x04])],
            }
        });

        let mut auth = handshake(&transport);
        assert_eq!(auth.state(), HandshakeState::Idle);
        assert_ok!(auth.authenticate(&credential).await);
        assert_eq!(auth.state(), HandshakeState::Authenticated);

        let writes = transport.written_to(Endpoint::Auth);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], vec![0x02, 0x00]);
        assert_eq!(writes[1].len(), 18);
        assert_eq!(&writes[1][..2], &[0x03, 0x00]);
        assert_eq!(transport.subscriptions(), vec![Endpoint::Auth]);

        // single use
        assert!(matches!(
            auth.authenticate(&credential).await,
            Err(BipError::HandshakeFinished)
        ));
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let transport = Arc::new(MockTransport::watch());
        transport.respond_with(|_, data| match data {
            [0x02, 0x00] => vec![Notification::new(Endpoint::Auth, challenge())],
            _ => vec![Notification::new(Endpoint::Auth, vec![0x10, 0x03, 0x04])],
        });

        let mut auth = handshake(&transport);
        let result = auth
            .authenticate(&Credential::from_hex("ffffffffffffffffffffffffffffffff").unwrap())
            .await;
        assert!(matches!(
            result,
            Err(BipError::AuthenticationFailed(AuthFailure::KeyRejected))
        ));
        assert_eq!(auth.state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn test_pairing_required() {
        let transport = Arc::new(MockTransport::watch());
        transport.respond_with(|_, _| {
            vec![Notification::new(Endpoint::Auth, vec![0x10, 0x01, 0x04])]
        });

        let mut auth = handshake(&transport);
        let result = auth.authenticate(&Credential::from_hex(KEY).unwrap()).await;
        assert!(matches!(
            result,
            Err(BipError::AuthenticationFailed(AuthFailure::PairingRequired))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_watch_times_out() {
        let transport = Arc::new(MockTransport::watch());
        let (events, mut rx) = EventSink::channel();
        let mut auth = handshake(&transport).with_events(events);

        let started = Instant::now();
        let result = auth.authenticate(&Credential::from_hex(KEY).unwrap()).await;
        assert!(matches!(
            result,
            Err(BipError::Timeout {
                operation: "handshake",
                timeout_ms: 10_000
            })
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(auth.state(), HandshakeState::Failed);
        assert!(matches!(rx.try_recv(), Ok(SyncEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn test_missing_auth_endpoint_fails_before_writing() {
        let transport = Arc::new(MockTransport::new(
            EndpointSet::new().with(Endpoint::Control, WriteCapabilities::BOTH),
        ));
        let mut auth = handshake(&transport);
        let err = auth
            .authenticate(&Credential::from_hex(KEY).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_configuration_error());
        assert!(transport.writes().is_empty());
    }

    #[tokio::test]
    async fn test_short_challenge_fails() {
        let transport = Arc::new(MockTransport::watch());
        transport.respond_with(|_, _| {
            vec![Notification::new(Endpoint::Auth, vec![0x10, 0x02, 0x01, 0xAA, 0xBB])]
        });
        let mut auth = handshake(&transport);
        let result = auth.authenticate(&Credential::from_hex(KEY).unwrap()).await;
        assert!(matches!(
            result,
            Err(BipError::AuthenticationFailed(AuthFailure::MalformedChallenge))
        ));
    }
}
