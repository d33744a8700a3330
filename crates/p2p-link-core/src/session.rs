//! Authenticated sessions and the handshake that negotiates them
//!
//! A session is negotiated with a four-step exchange layered on a Noise XX
//! handshake:
//!
//! 1. `InitiatorHello` carries Noise message 1, the offered protocol modes
//!    and the initiator's maximum message size.
//! 2. `ResponderHello` carries Noise message 2, the selected mode and the
//!    agreed size.
//! 3. `InitiatorHandshake` carries Noise message 3 and the initiator's
//!    identity signature over the final handshake hash.
//! 4. `ResponderHandshake` carries the responder's identity signature.
//!
//! Once complete, both sides hold a [`NoiseSession`]. Sealed messages carry
//! their nonce explicitly so they can be opened in any order.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snow::{Builder, HandshakeState, StatelessTransportState};

use crate::crypto::{
    handshake_signing_payload, verify_signature, HandshakeRole, NoiseKeyPair, NOISE_PATTERN,
};
use crate::errors::{CryptographicError, HandshakeError, SessionError};
use crate::records::{
    InitiatorHandshakeMessage, InitiatorHelloMessage, ResponderHandshakeMessage,
    ResponderHelloMessage,
};
use crate::types::{CounterpartyKey, SessionId};
use crate::{LinkError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Largest Noise frame snow will produce or accept
const NOISE_MAX_MESSAGE_LEN: usize = 65_535;

/// AEAD tag length of ChaChaPoly
pub const TAG_LEN: usize = 16;

// ----------------------------------------------------------------------------
// Protocol Mode
// ----------------------------------------------------------------------------

/// What a session protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolMode {
    /// Payloads travel in the clear with an authentication tag
    Authentication,
    /// Payloads are encrypted and authenticated
    AuthenticatedEncryption,
}

/// Pick the strongest mode both sides support
pub fn select_protocol_mode(
    offered: &[ProtocolMode],
    supported: &[ProtocolMode],
) -> Option<ProtocolMode> {
    [ProtocolMode::AuthenticatedEncryption, ProtocolMode::Authentication]
        .into_iter()
        .find(|mode| offered.contains(mode) && supported.contains(mode))
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// Payload sealed under a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub nonce: u64,
    /// Ciphertext in encryption mode, plaintext in authentication mode
    pub payload: Vec<u8>,
    /// Authentication tag, present only in authentication mode
    pub tag: Option<Vec<u8>>,
}

/// An established authenticated channel
///
/// Implementations never expose key material; callers can only seal and
/// open payloads.
pub trait Session: Send + Sync + fmt::Debug {
    fn session_id(&self) -> &SessionId;

    fn mode(&self) -> ProtocolMode;

    /// Largest plaintext `seal` accepts
    fn max_message_size(&self) -> u32;

    /// Authenticate, and in encryption mode encrypt, a payload
    fn seal(&self, plaintext: &[u8]) -> Result<SealedPayload>;

    /// Validate, and in encryption mode decrypt, a sealed payload
    fn open(&self, sealed: &SealedPayload) -> Result<Vec<u8>>;
}

/// Session backed by a completed Noise handshake
pub struct NoiseSession {
    session_id: SessionId,
    mode: ProtocolMode,
    max_message_size: u32,
    transport: StatelessTransportState,
    next_nonce: AtomicU64,
}

impl fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseSession")
            .field("session_id", &self.session_id)
            .field("mode", &self.mode)
            .field("max_message_size", &self.max_message_size)
            .field("transport", &"<StatelessTransportState>")
            .finish()
    }
}

impl NoiseSession {
    fn new(
        session_id: SessionId,
        mode: ProtocolMode,
        max_message_size: u32,
        transport: StatelessTransportState,
    ) -> Self {
        Self {
            session_id,
            mode,
            max_message_size,
            transport,
            next_nonce: AtomicU64::new(0),
        }
    }

    fn encrypt(&self, nonce: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut ciphertext = vec![0u8; plaintext.len() + TAG_LEN];
        let len = self
            .transport
            .write_message(nonce, plaintext, &mut ciphertext)
            .map_err(|_| CryptographicError::EncryptionFailed)?;
        ciphertext.truncate(len);
        Ok(ciphertext)
    }

    fn decrypt(&self, nonce: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut plaintext = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(nonce, ciphertext, &mut plaintext)
            .map_err(|_| CryptographicError::DecryptionFailed)?;
        plaintext.truncate(len);
        Ok(plaintext)
    }
}

impl Session for NoiseSession {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn mode(&self) -> ProtocolMode {
        self.mode
    }

    fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    fn seal(&self, plaintext: &[u8]) -> Result<SealedPayload> {
        if plaintext.len() > self.max_message_size as usize {
            return Err(SessionError::PayloadTooLarge {
                size: plaintext.len(),
                max: self.max_message_size,
            }
            .into());
        }

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            ProtocolMode::AuthenticatedEncryption => Ok(SealedPayload {
                nonce,
                payload: self.encrypt(nonce, plaintext)?,
                tag: None,
            }),
            ProtocolMode::Authentication => {
                let digest = Sha256::digest(plaintext);
                Ok(SealedPayload {
                    nonce,
                    payload: plaintext.to_vec(),
                    tag: Some(self.encrypt(nonce, &digest)?),
                })
            }
        }
    }

    fn open(&self, sealed: &SealedPayload) -> Result<Vec<u8>> {
        match self.mode {
            ProtocolMode::AuthenticatedEncryption => self.decrypt(sealed.nonce, &sealed.payload),
            ProtocolMode::Authentication => {
                let tag = sealed.tag.as_deref().ok_or_else(|| SessionError::MissingTag {
                    session_id: self.session_id.to_string(),
                })?;
                let expected = self.decrypt(sealed.nonce, tag)?;
                if expected.as_slice() == Sha256::digest(&sealed.payload).as_slice() {
                    Ok(sealed.payload.clone())
                } else {
                    Err(LinkError::signature_error())
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Handshake Step Tracking
// ----------------------------------------------------------------------------

/// Position of one side in the four-step exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Initial,
    HelloSent,
    HelloReceived,
    HandshakeSent,
    HandshakeReceived,
    Complete,
}

fn expect_step(session_id: &SessionId, actual: HandshakeStep, expected: HandshakeStep) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(LinkError::unexpected_step(
            session_id.as_str(),
            format!("{:?}", expected),
            format!("{:?}", actual),
        ))
    }
}

fn noise_write(handshake: &mut HandshakeState) -> Result<Vec<u8>> {
    let mut output = vec![0u8; NOISE_MAX_MESSAGE_LEN];
    let len = handshake.write_message(&[], &mut output)?;
    output.truncate(len);
    Ok(output)
}

fn noise_read(handshake: &mut HandshakeState, input: &[u8]) -> Result<()> {
    let mut payload = vec![0u8; NOISE_MAX_MESSAGE_LEN];
    handshake.read_message(input, &mut payload)?;
    Ok(())
}

fn validate_message_size(size: u32) -> Result<u32> {
    if size == 0 || size as usize > NOISE_MAX_MESSAGE_LEN - TAG_LEN {
        return Err(HandshakeError::InvalidMessageSize { size }.into());
    }
    Ok(size)
}

/// Finish the Noise handshake, returning its hash and the transport state
fn finish(handshake: HandshakeState) -> Result<(Vec<u8>, StatelessTransportState)> {
    if !handshake.is_handshake_finished() {
        return Err(HandshakeError::Incomplete.into());
    }
    let hash = handshake.get_handshake_hash().to_vec();
    let transport = handshake.into_stateless_transport_mode()?;
    Ok((hash, transport))
}

// ----------------------------------------------------------------------------
// Unsigned Handshake Messages
// ----------------------------------------------------------------------------

/// Step-3 message whose identity signature is still missing
///
/// The protocol has already moved past step 3, so signing can happen after
/// the caller releases whatever guards the protocol state.
#[derive(Debug, Clone)]
pub struct UnsignedInitiatorHandshake {
    session_id: SessionId,
    noise: Vec<u8>,
    signing_payload: Vec<u8>,
}

impl UnsignedInitiatorHandshake {
    /// Bytes the initiator's identity key must sign
    pub fn signing_payload(&self) -> &[u8] {
        &self.signing_payload
    }

    pub fn with_signature(self, signature: Vec<u8>) -> InitiatorHandshakeMessage {
        InitiatorHandshakeMessage {
            session_id: self.session_id,
            noise: self.noise,
            signature,
        }
    }
}

/// Step-4 message whose identity signature is still missing
#[derive(Debug, Clone)]
pub struct UnsignedResponderHandshake {
    session_id: SessionId,
    signing_payload: Vec<u8>,
}

impl UnsignedResponderHandshake {
    /// Bytes the responder's identity key must sign
    pub fn signing_payload(&self) -> &[u8] {
        &self.signing_payload
    }

    pub fn with_signature(self, signature: Vec<u8>) -> ResponderHandshakeMessage {
        ResponderHandshakeMessage {
            session_id: self.session_id,
            signature,
        }
    }
}

// ----------------------------------------------------------------------------
// Initiator
// ----------------------------------------------------------------------------

/// The side that starts a negotiation
pub struct AuthenticationProtocolInitiator {
    session_id: SessionId,
    counterparties: CounterpartyKey,
    offered_modes: Vec<ProtocolMode>,
    max_message_size: u32,
    step: HandshakeStep,
    handshake: Option<HandshakeState>,
    transport: Option<StatelessTransportState>,
    handshake_hash: Vec<u8>,
    selected_mode: Option<ProtocolMode>,
}

impl fmt::Debug for AuthenticationProtocolInitiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationProtocolInitiator")
            .field("session_id", &self.session_id)
            .field("counterparties", &self.counterparties)
            .field("step", &self.step)
            .finish()
    }
}

impl AuthenticationProtocolInitiator {
    pub fn new(
        session_id: SessionId,
        counterparties: CounterpartyKey,
        offered_modes: Vec<ProtocolMode>,
        max_message_size: u32,
    ) -> Result<Self> {
        let keypair = NoiseKeyPair::generate()?;
        let handshake = Builder::new(NOISE_PATTERN.parse()?)
            .local_private_key(keypair.private_key_bytes())
            .build_initiator()?;

        Ok(Self {
            session_id,
            counterparties,
            offered_modes,
            max_message_size: validate_message_size(max_message_size)?,
            step: HandshakeStep::Initial,
            handshake: Some(handshake),
            transport: None,
            handshake_hash: Vec::new(),
            selected_mode: None,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn counterparties(&self) -> &CounterpartyKey {
        &self.counterparties
    }

    pub fn step(&self) -> HandshakeStep {
        self.step
    }

    fn handshake_mut(&mut self) -> Result<&mut HandshakeState> {
        let session_id = self.session_id.to_string();
        self.handshake
            .as_mut()
            .ok_or_else(|| LinkError::unexpected_step(session_id, "handshake in progress", "transport"))
    }

    /// Step 1
    pub fn generate_initiator_hello(&mut self) -> Result<InitiatorHelloMessage> {
        expect_step(&self.session_id, self.step, HandshakeStep::Initial)?;
        let noise = noise_write(self.handshake_mut()?)?;
        self.step = HandshakeStep::HelloSent;

        Ok(InitiatorHelloMessage {
            session_id: self.session_id.clone(),
            source: self.counterparties.our_id.clone(),
            destination: self.counterparties.counterparty_id.clone(),
            protocol_modes: self.offered_modes.clone(),
            max_message_size: self.max_message_size,
            noise,
        })
    }

    /// Step 2, received
    pub fn receive_responder_hello(&mut self, message: &ResponderHelloMessage) -> Result<()> {
        expect_step(&self.session_id, self.step, HandshakeStep::HelloSent)?;

        if !self.offered_modes.contains(&message.selected_mode) {
            return Err(HandshakeError::UnsupportedProtocolMode {
                mode: format!("{:?}", message.selected_mode),
            }
            .into());
        }
        let agreed = validate_message_size(message.max_message_size)?;
        if agreed > self.max_message_size {
            return Err(HandshakeError::InvalidMessageSize { size: agreed }.into());
        }

        noise_read(self.handshake_mut()?, &message.noise)?;
        self.selected_mode = Some(message.selected_mode);
        self.max_message_size = agreed;
        self.step = HandshakeStep::HelloReceived;
        Ok(())
    }

    /// Step 3; the returned message still needs our identity signature
    pub fn generate_our_handshake_message(&mut self) -> Result<UnsignedInitiatorHandshake> {
        expect_step(&self.session_id, self.step, HandshakeStep::HelloReceived)?;

        let noise = noise_write(self.handshake_mut()?)?;
        let handshake = self
            .handshake
            .take()
            .ok_or(HandshakeError::Incomplete)?;
        let (hash, transport) = finish(handshake)?;
        let signing_payload =
            handshake_signing_payload(HandshakeRole::Initiator, &self.session_id, &hash);

        self.handshake_hash = hash;
        self.transport = Some(transport);
        self.step = HandshakeStep::HandshakeSent;

        Ok(UnsignedInitiatorHandshake {
            session_id: self.session_id.clone(),
            noise,
            signing_payload,
        })
    }

    /// Step 4, received; verifies the responder's identity signature
    pub fn validate_peer_handshake_message(
        &mut self,
        message: &ResponderHandshakeMessage,
        responder_session_key: &[u8; 32],
    ) -> Result<()> {
        expect_step(&self.session_id, self.step, HandshakeStep::HandshakeSent)?;

        let payload =
            handshake_signing_payload(HandshakeRole::Responder, &self.session_id, &self.handshake_hash);
        verify_signature(responder_session_key, payload, &message.signature)?;
        self.step = HandshakeStep::Complete;
        Ok(())
    }

    /// Consume the completed handshake
    pub fn into_session(self) -> Result<NoiseSession> {
        expect_step(&self.session_id, self.step, HandshakeStep::Complete)?;
        let mode = self.selected_mode.ok_or(HandshakeError::Incomplete)?;
        let transport = self.transport.ok_or(HandshakeError::Incomplete)?;
        Ok(NoiseSession::new(self.session_id, mode, self.max_message_size, transport))
    }
}

// ----------------------------------------------------------------------------
// Responder
// ----------------------------------------------------------------------------

/// The side that answers a negotiation
pub struct AuthenticationProtocolResponder {
    session_id: SessionId,
    supported_modes: Vec<ProtocolMode>,
    max_message_size: u32,
    step: HandshakeStep,
    handshake: Option<HandshakeState>,
    transport: Option<StatelessTransportState>,
    handshake_hash: Vec<u8>,
    selected_mode: Option<ProtocolMode>,
}

impl fmt::Debug for AuthenticationProtocolResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationProtocolResponder")
            .field("session_id", &self.session_id)
            .field("step", &self.step)
            .finish()
    }
}

impl AuthenticationProtocolResponder {
    pub fn new(
        session_id: SessionId,
        supported_modes: Vec<ProtocolMode>,
        max_message_size: u32,
    ) -> Result<Self> {
        let keypair = NoiseKeyPair::generate()?;
        let handshake = Builder::new(NOISE_PATTERN.parse()?)
            .local_private_key(keypair.private_key_bytes())
            .build_responder()?;

        Ok(Self {
            session_id,
            supported_modes,
            max_message_size: validate_message_size(max_message_size)?,
            step: HandshakeStep::Initial,
            handshake: Some(handshake),
            transport: None,
            handshake_hash: Vec::new(),
            selected_mode: None,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn step(&self) -> HandshakeStep {
        self.step
    }

    pub fn selected_mode(&self) -> Option<ProtocolMode> {
        self.selected_mode
    }

    fn handshake_mut(&mut self) -> Result<&mut HandshakeState> {
        let session_id = self.session_id.to_string();
        self.handshake
            .as_mut()
            .ok_or_else(|| LinkError::unexpected_step(session_id, "handshake in progress", "transport"))
    }

    /// Step 1, received
    pub fn receive_initiator_hello(&mut self, message: &InitiatorHelloMessage) -> Result<()> {
        expect_step(&self.session_id, self.step, HandshakeStep::Initial)?;

        let mode = select_protocol_mode(&message.protocol_modes, &self.supported_modes)
            .ok_or_else(|| HandshakeError::NoCommonProtocolMode {
                offered: format!("{:?}", message.protocol_modes),
                supported: format!("{:?}", self.supported_modes),
            })?;
        let proposed = validate_message_size(message.max_message_size)?;

        noise_read(self.handshake_mut()?, &message.noise)?;
        self.selected_mode = Some(mode);
        self.max_message_size = self.max_message_size.min(proposed);
        self.step = HandshakeStep::HelloReceived;
        Ok(())
    }

    /// Step 2
    pub fn generate_responder_hello(&mut self) -> Result<ResponderHelloMessage> {
        expect_step(&self.session_id, self.step, HandshakeStep::HelloReceived)?;
        let selected_mode = self.selected_mode.ok_or(HandshakeError::Incomplete)?;
        let noise = noise_write(self.handshake_mut()?)?;
        self.step = HandshakeStep::HelloSent;

        Ok(ResponderHelloMessage {
            session_id: self.session_id.clone(),
            selected_mode,
            max_message_size: self.max_message_size,
            noise,
        })
    }

    /// Step 3, received; verifies the initiator's identity signature
    pub fn validate_peer_handshake_message(
        &mut self,
        message: &InitiatorHandshakeMessage,
        initiator_session_key: &[u8; 32],
    ) -> Result<()> {
        expect_step(&self.session_id, self.step, HandshakeStep::HelloSent)?;

        noise_read(self.handshake_mut()?, &message.noise)?;
        let handshake = self
            .handshake
            .take()
            .ok_or(HandshakeError::Incomplete)?;
        let (hash, transport) = finish(handshake)?;

        let payload = handshake_signing_payload(HandshakeRole::Initiator, &self.session_id, &hash);
        verify_signature(initiator_session_key, payload, &message.signature)?;

        self.handshake_hash = hash;
        self.transport = Some(transport);
        self.step = HandshakeStep::HandshakeReceived;
        Ok(())
    }

    /// Step 4; the returned message still needs our identity signature
    pub fn generate_our_handshake_message(&mut self) -> Result<UnsignedResponderHandshake> {
        expect_step(&self.session_id, self.step, HandshakeStep::HandshakeReceived)?;
        let signing_payload =
            handshake_signing_payload(HandshakeRole::Responder, &self.session_id, &self.handshake_hash);
        self.step = HandshakeStep::Complete;

        Ok(UnsignedResponderHandshake {
            session_id: self.session_id.clone(),
            signing_payload,
        })
    }

    /// Consume the completed handshake
    pub fn into_session(self) -> Result<NoiseSession> {
        expect_step(&self.session_id, self.step, HandshakeStep::Complete)?;
        let mode = self.selected_mode.ok_or(HandshakeError::Incomplete)?;
        let transport = self.transport.ok_or(HandshakeError::Incomplete)?;
        Ok(NoiseSession::new(self.session_id, mode, self.max_message_size, transport))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
