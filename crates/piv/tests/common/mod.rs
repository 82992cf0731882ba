//! Common test utilities
//!
//! [`SimulatedToken`] is an in-memory PIV token behind [`CardTransport`]. It
//! keeps PIN and PUK counters, a 3DES or AES management key, P-256 slots, data
//! objects (with command chaining and `GET RESPONSE`) and metadata, and can
//! drop transmissions on request.
#![allow(dead_code, unreachable_pub)]

use std::collections::HashMap;

use nexum_apdu_core::{Bytes, CLA_CHAINING, CardTransport, Command, TransportError};
use nexum_piv::constants::{
    DEFAULT_PIN, DEFAULT_PUK, DEFAULT_RETRY_COUNT, PIN_PADDED_LEN, PIN_PADDING, PIV_AID, ins,
    objects,
};
use nexum_piv::{
    Credential, FirmwareVersion, KeyStatus, ManagementKey, ManagementKeyAlgorithm, PinPolicy,
    PivSession, SessionConfig, SlotId, TouchPolicy,
};
use p256::ecdsa::signature::hazmat::RandomizedPrehashSigner;
use p256::ecdsa::{Signature as EcdsaSignature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey as P256PublicKey, SecretKey};
use rand_v8::RngCore;
use tracing_subscriber::EnvFilter;

pub const V4_3: FirmwareVersion = FirmwareVersion::new(4, 3, 7);
pub const V5_2: FirmwareVersion = FirmwareVersion::new(5, 2, 7);
pub const V5_4: FirmwareVersion = FirmwareVersion::new(5, 4, 3);
pub const V5_7: FirmwareVersion = FirmwareVersion::new(5, 7, 1);

/// Largest data field in one reply, the rest waits for GET RESPONSE
const RESPONSE_CHUNK: usize = 256;

const P256_ID: u8 = 0x11;

const SUCCESS: u16 = 0x9000;
const SECURITY_STATUS: u16 = 0x6982;
const BLOCKED: u16 = 0x6983;
const CONDITIONS: u16 = 0x6985;
const INCORRECT_DATA: u16 = 0x6A80;
const NOT_FOUND: u16 = 0x6A82;
const INCORRECT_P1P2: u16 = 0x6A86;
const REFERENCE_NOT_FOUND: u16 = 0x6A88;
const INS_NOT_SUPPORTED: u16 = 0x6D00;

type Outcome = Result<Vec<u8>, u16>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn open(token: SimulatedToken) -> PivSession<SimulatedToken> {
    open_with(token, SessionConfig::new())
}

pub fn open_with(token: SimulatedToken, config: SessionConfig) -> PivSession<SimulatedToken> {
    init_tracing();
    PivSession::open(token, config).expect("session opens")
}

/// Close the session, reset the card and open a new session on it
pub fn reopen(
    session: PivSession<SimulatedToken>,
    config: SessionConfig,
) -> PivSession<SimulatedToken> {
    let mut token = session.close();
    token.reset().expect("simulated reset");
    open_with(token, config)
}

pub fn default_pin() -> Credential {
    Credential::new(DEFAULT_PIN)
}

pub fn default_puk() -> Credential {
    Credential::new(DEFAULT_PUK)
}

pub fn default_management_key(session: &PivSession<SimulatedToken>) -> ManagementKey {
    ManagementKey::default_for(session.policy().default_management_key_algorithm())
}

/// Mutually authenticate with the factory management key
pub fn authenticate(session: &mut PivSession<SimulatedToken>) {
    let key = default_management_key(session);
    session
        .auth()
        .authenticate_management_key(&key, true)
        .expect("default management key authenticates");
}

pub fn token(session: &mut PivSession<SimulatedToken>) -> &SimulatedToken {
    session.channel().transport()
}

pub fn token_mut(session: &mut PivSession<SimulatedToken>) -> &mut SimulatedToken {
    session.channel().transport_mut()
}

/// Verify an ECDSA P-256 signature over a prehashed digest
pub fn verify_p256(point: &[u8], digest: &[u8], der: &[u8]) -> bool {
    use p256::ecdsa::VerifyingKey;
    use p256::ecdsa::signature::hazmat::PrehashVerifier;

    let Ok(key) = VerifyingKey::from_sec1_bytes(point) else {
        return false;
    };
    let Ok(signature) = EcdsaSignature::from_der(der) else {
        return false;
    };
    key.verify_prehash(digest, &signature).is_ok()
}

#[derive(Debug)]
struct Counter {
    value: [u8; PIN_PADDED_LEN],
    remaining: u8,
    max: u8,
    is_default: bool,
}

impl Counter {
    fn new(value: &[u8], max: u8) -> Self {
        Self {
            value: pad(value),
            remaining: max,
            max,
            is_default: true,
        }
    }

    const fn status(&self) -> u16 {
        if self.remaining == 0 { BLOCKED } else { 0x63C0 | self.remaining as u16 }
    }

    fn check(&mut self, candidate: &[u8]) -> Result<(), u16> {
        if candidate.len() != PIN_PADDED_LEN {
            return Err(INCORRECT_DATA);
        }
        if self.remaining == 0 {
            return Err(BLOCKED);
        }
        if candidate == self.value {
            self.remaining = self.max;
            Ok(())
        } else {
            self.remaining -= 1;
            Err(0x63C0 | self.remaining as u16)
        }
    }

    fn set(&mut self, value: &[u8]) {
        self.value.copy_from_slice(value);
        self.remaining = self.max;
        self.is_default = false;
    }
}

fn pad(value: &[u8]) -> [u8; PIN_PADDED_LEN] {
    let mut padded = [PIN_PADDING; PIN_PADDED_LEN];
    padded[..value.len()].copy_from_slice(value);
    padded
}

#[derive(Debug)]
struct Slot {
    pin_policy: PinPolicy,
    touch_policy: TouchPolicy,
    origin: KeyStatus,
    secret: SecretKey,
}

impl Slot {
    fn point(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }
}

#[derive(Debug, Default)]
enum PendingAuth {
    #[default]
    Idle,
    Witness(Vec<u8>),
    Challenge(Vec<u8>),
}

/// In-memory PIV token
#[derive(Debug)]
pub struct SimulatedToken {
    version: FirmwareVersion,
    serial: u32,
    compliance_mode: bool,
    pin: Counter,
    puk: Counter,
    pin_verified: bool,
    /// Verification not yet spent on a PIN-Always slot
    pin_always_ready: bool,
    management_key: ManagementKey,
    management_touch: TouchPolicy,
    management_default: bool,
    authenticated: bool,
    pending: PendingAuth,
    corrupt_mutual_proof: bool,
    slots: HashMap<u8, Slot>,
    objects: HashMap<u32, Vec<u8>>,
    chain: Vec<u8>,
    outgoing: Vec<u8>,
    fail_next: usize,
    fail_after: Option<usize>,
    instructions: Vec<u8>,
}

impl SimulatedToken {
    /// Factory-fresh token with the given firmware
    pub fn new(version: FirmwareVersion) -> Self {
        let algorithm = if version >= V5_7 {
            ManagementKeyAlgorithm::Aes192
        } else {
            ManagementKeyAlgorithm::TripleDes
        };
        Self {
            version,
            serial: 1_234_567,
            compliance_mode: false,
            pin: Counter::new(DEFAULT_PIN, DEFAULT_RETRY_COUNT),
            puk: Counter::new(DEFAULT_PUK, DEFAULT_RETRY_COUNT),
            pin_verified: false,
            pin_always_ready: false,
            management_key: ManagementKey::default_for(algorithm),
            management_touch: TouchPolicy::Never,
            management_default: true,
            authenticated: false,
            pending: PendingAuth::Idle,
            corrupt_mutual_proof: false,
            slots: HashMap::new(),
            objects: HashMap::new(),
            chain: Vec::new(),
            outgoing: Vec::new(),
            fail_next: 0,
            fail_after: None,
            instructions: Vec::new(),
        }
    }

    pub const fn with_compliance_mode(mut self, compliance_mode: bool) -> Self {
        self.compliance_mode = compliance_mode;
        self
    }

    /// Answer mutual authentication with a proof the host cannot verify
    pub const fn with_corrupt_mutual_proof(mut self) -> Self {
        self.corrupt_mutual_proof = true;
        self
    }

    /// Drop the next `count` transmissions, losing any partial command chain
    pub fn fail_next_transmissions(&mut self, count: usize) {
        self.fail_next = count;
    }

    /// Let `count` transmissions through, then drop the next one
    pub fn fail_transmission_after(&mut self, count: usize) {
        self.fail_after = Some(count);
    }

    /// Cancel any scheduled transmission failure
    pub fn stop_failing(&mut self) {
        self.fail_next = 0;
        self.fail_after = None;
    }

    /// Instruction bytes of every command that reached the token
    pub fn instructions(&self) -> &[u8] {
        &self.instructions
    }

    pub fn count(&self, ins: u8) -> usize {
        self.instructions.iter().filter(|&&seen| seen == ins).count()
    }

    /// Stored object including its `53` wrapper
    pub fn object(&self, id: u32) -> Option<&[u8]> {
        self.objects.get(&id).map(Vec::as_slice)
    }

    /// Overwrite an object value behind the client's back
    pub fn store_object(&mut self, id: u32, value: &[u8]) {
        let mut wrapped = Vec::new();
        write_tlv(&mut wrapped, &[0x53], value);
        self.objects.insert(id, wrapped);
    }

    /// Store the exact GET DATA reply for an object
    pub fn store_raw(&mut self, id: u32, raw: &[u8]) {
        self.objects.insert(id, raw.to_vec());
    }

    pub fn remove_object(&mut self, id: u32) {
        self.objects.remove(&id);
    }

    pub const fn pin_retries(&self) -> (u8, u8) {
        (self.pin.remaining, self.pin.max)
    }

    pub const fn puk_retries(&self) -> (u8, u8) {
        (self.puk.remaining, self.puk.max)
    }

    pub const fn management_key(&self) -> &ManagementKey {
        &self.management_key
    }

    pub fn has_key(&self, slot: SlotId) -> bool {
        self.slots.contains_key(&slot.to_byte())
    }

    /// Forget the PIN verification, as after the card was removed
    pub fn forget_pin(&mut self) {
        self.pin_verified = false;
        self.pin_always_ready = false;
    }

    fn require_version(&self, since: FirmwareVersion) -> Result<(), u16> {
        if self.version >= since { Ok(()) } else { Err(INS_NOT_SUPPORTED) }
    }

    const fn require_management_key(&self) -> Result<(), u16> {
        if self.authenticated { Ok(()) } else { Err(SECURITY_STATUS) }
    }

    fn handle(&mut self, command: &Command, data: &[u8]) -> Outcome {
        match command.ins {
            ins::SELECT if data.starts_with(PIV_AID) => Ok(Vec::new()),
            ins::SELECT => Err(NOT_FOUND),
            ins::GET_VERSION => Ok(vec![self.version.major, self.version.minor, self.version.patch]),
            ins::GET_SERIAL => {
                self.require_version(FirmwareVersion::new(5, 0, 0))?;
                Ok(self.serial.to_be_bytes().to_vec())
            }
            ins::GET_RESPONSE => match std::mem::take(&mut self.outgoing) {
                pending if pending.is_empty() => Err(CONDITIONS),
                pending => Ok(pending),
            },
            ins::VERIFY => self.verify(command.p2, data),
            ins::CHANGE_REFERENCE => self.change_reference(command.p2, data),
            ins::RESET_RETRY_COUNTER => self.reset_retry_counter(command.p2, data),
            ins::GENERAL_AUTHENTICATE if command.p2 == 0x9B => self.authenticate(command.p1, data),
            ins::GENERAL_AUTHENTICATE => self.private_key_operation(command.p1, command.p2, data),
            ins::SET_MANAGEMENT_KEY => self.set_management_key(command.p2, data),
            ins::SET_PIN_RETRIES => self.set_pin_retries(command.p1, command.p2),
            ins::RESET => self.reset_application(),
            ins::GENERATE_ASYMMETRIC => self.generate(command.p2, data),
            ins::IMPORT_KEY => self.import(command.p1, command.p2, data),
            ins::GET_DATA => self.get_data(data),
            ins::PUT_DATA => self.put_data(data),
            ins::GET_METADATA => self.metadata(command.p2),
            ins::ATTEST => self.attest(command.p1),
            _ => Err(INS_NOT_SUPPORTED),
        }
    }

    fn verify(&mut self, reference: u8, data: &[u8]) -> Outcome {
        if reference != 0x80 {
            return Err(INCORRECT_P1P2);
        }
        if data.is_empty() {
            return if self.pin_verified { Ok(Vec::new()) } else { Err(self.pin.status()) };
        }
        match self.pin.check(data) {
            Ok(()) => {
                self.pin_verified = true;
                self.pin_always_ready = true;
                Ok(Vec::new())
            }
            Err(status) => {
                self.forget_pin();
                Err(status)
            }
        }
    }

    fn change_reference(&mut self, reference: u8, data: &[u8]) -> Outcome {
        if data.len() != 2 * PIN_PADDED_LEN {
            return Err(INCORRECT_DATA);
        }
        let counter = match reference {
            0x80 => &mut self.pin,
            0x81 => &mut self.puk,
            _ => return Err(INCORRECT_P1P2),
        };
        counter.check(&data[..PIN_PADDED_LEN])?;
        counter.set(&data[PIN_PADDED_LEN..]);
        if reference == 0x80 {
            self.forget_pin();
        }
        Ok(Vec::new())
    }

    fn reset_retry_counter(&mut self, reference: u8, data: &[u8]) -> Outcome {
        if reference != 0x80 {
            return Err(INCORRECT_P1P2);
        }
        if data.len() != 2 * PIN_PADDED_LEN {
            return Err(INCORRECT_DATA);
        }
        self.puk.check(&data[..PIN_PADDED_LEN])?;
        self.pin.set(&data[PIN_PADDED_LEN..]);
        self.forget_pin();
        Ok(Vec::new())
    }

    fn authenticate(&mut self, algorithm: u8, data: &[u8]) -> Outcome {
        if algorithm != self.management_key.algorithm().id() {
            self.pending = PendingAuth::Idle;
            return Err(INCORRECT_P1P2);
        }
        let items = dynamic_auth(data).ok_or(INCORRECT_DATA)?;
        let item = |tag: u8| items.iter().find(|(t, _)| *t == tag).map(|(_, v)| v.as_slice());
        let block_len = self.management_key.algorithm().block_len();
        let encrypt = |key: &ManagementKey, data: &[u8]| key.encrypt(data).map_err(|_| INCORRECT_DATA);

        match (item(0x80), item(0x81), item(0x82)) {
            (Some([]), None, None) => {
                let witness = random(block_len);
                let encrypted = encrypt(&self.management_key, &witness)?;
                self.pending = PendingAuth::Witness(witness);
                Ok(dynamic_auth_reply(0x80, &encrypted))
            }
            (Some(witness), Some(challenge), None) => {
                let PendingAuth::Witness(expected) = std::mem::take(&mut self.pending) else {
                    return Err(CONDITIONS);
                };
                if expected != witness {
                    self.authenticated = false;
                    return Err(SECURITY_STATUS);
                }
                self.authenticated = true;
                let mut proof = encrypt(&self.management_key, challenge)?;
                if self.corrupt_mutual_proof {
                    proof[0] ^= 0xFF;
                }
                Ok(dynamic_auth_reply(0x82, &proof))
            }
            (None, Some([]), None) => {
                let challenge = random(block_len);
                self.pending = PendingAuth::Challenge(challenge.clone());
                Ok(dynamic_auth_reply(0x81, &challenge))
            }
            (None, None, Some(response)) => {
                let PendingAuth::Challenge(challenge) = std::mem::take(&mut self.pending) else {
                    return Err(CONDITIONS);
                };
                if encrypt(&self.management_key, &challenge)? == response {
                    self.authenticated = true;
                    Ok(Vec::new())
                } else {
                    self.authenticated = false;
                    Err(SECURITY_STATUS)
                }
            }
            _ => Err(INCORRECT_DATA),
        }
    }

    fn set_management_key(&mut self, touch: u8, data: &[u8]) -> Outcome {
        self.require_management_key()?;
        let [id, 0x9B, len, key @ ..] = data else {
            return Err(INCORRECT_DATA);
        };
        if usize::from(*len) != key.len() {
            return Err(INCORRECT_DATA);
        }
        let algorithm = ManagementKeyAlgorithm::from_id(*id).map_err(|_| INCORRECT_DATA)?;
        if algorithm.is_aes() {
            self.require_version(FirmwareVersion::new(5, 4, 0))?;
        }
        if self.compliance_mode && self.version >= V5_7 && !algorithm.is_aes() {
            return Err(CONDITIONS);
        }
        self.management_key =
            ManagementKey::new(algorithm, key.to_vec()).map_err(|_| INCORRECT_DATA)?;
        self.management_touch = if touch == 0xFF { TouchPolicy::Never } else { TouchPolicy::Always };
        self.management_default = false;
        Ok(Vec::new())
    }

    fn set_pin_retries(&mut self, pin: u8, puk: u8) -> Outcome {
        self.require_management_key()?;
        if pin == 0 || puk == 0 {
            return Err(INCORRECT_P1P2);
        }
        self.pin = Counter::new(DEFAULT_PIN, pin);
        self.puk = Counter::new(DEFAULT_PUK, puk);
        self.forget_pin();
        Ok(Vec::new())
    }

    fn reset_application(&mut self) -> Outcome {
        if self.pin.remaining != 0 || self.puk.remaining != 0 {
            return Err(CONDITIONS);
        }
        let instructions = std::mem::take(&mut self.instructions);
        *self = Self::new(self.version)
            .with_compliance_mode(self.compliance_mode);
        self.instructions = instructions;
        Ok(Vec::new())
    }

    fn slot_policies(slot: SlotId, items: &[(u8, Vec<u8>)]) -> Result<(PinPolicy, TouchPolicy), u16> {
        let pin = match find(items, 0xAA) {
            Some([byte]) => PinPolicy::from_byte(*byte).map_err(|_| INCORRECT_DATA)?,
            Some(_) => return Err(INCORRECT_DATA),
            None => PinPolicy::Default,
        };
        let touch = match find(items, 0xAB) {
            Some([byte]) => TouchPolicy::from_byte(*byte).map_err(|_| INCORRECT_DATA)?,
            Some(_) => return Err(INCORRECT_DATA),
            None => TouchPolicy::Default,
        };
        Ok((slot.resolve_pin_policy(pin), slot.resolve_touch_policy(touch)))
    }

    fn generate(&mut self, slot: u8, data: &[u8]) -> Outcome {
        self.require_management_key()?;
        let slot_id = SlotId::try_from(slot).map_err(|_| INCORRECT_P1P2)?;
        let (tag, template, _) = split_tlv(data).ok_or(INCORRECT_DATA)?;
        if tag != [0xAC] {
            return Err(INCORRECT_DATA);
        }
        let items = parse_tlvs(template).ok_or(INCORRECT_DATA)?;
        if find(&items, 0x80) != Some(&[P256_ID][..]) {
            return Err(INCORRECT_DATA);
        }
        let (pin_policy, touch_policy) = Self::slot_policies(slot_id, &items)?;

        let entry = Slot {
            pin_policy,
            touch_policy,
            origin: KeyStatus::Generated,
            secret: SecretKey::random(&mut rand_v8::thread_rng()),
        };
        let mut template = Vec::new();
        write_tlv(&mut template, &[0x86], &entry.point());
        let mut reply = Vec::new();
        write_tlv(&mut reply, &[0x7F, 0x49], &template);
        self.slots.insert(slot, entry);
        Ok(reply)
    }

    fn import(&mut self, algorithm: u8, slot: u8, data: &[u8]) -> Outcome {
        self.require_management_key()?;
        let slot_id = SlotId::try_from(slot).map_err(|_| INCORRECT_P1P2)?;
        if algorithm != P256_ID {
            return Err(INCORRECT_DATA);
        }
        let items = parse_tlvs(data).ok_or(INCORRECT_DATA)?;
        let scalar = find(&items, 0x06).ok_or(INCORRECT_DATA)?;
        let secret = SecretKey::from_slice(scalar).map_err(|_| INCORRECT_DATA)?;
        let (pin_policy, touch_policy) = Self::slot_policies(slot_id, &items)?;
        self.slots.insert(
            slot,
            Slot {
                pin_policy,
                touch_policy,
                origin: KeyStatus::Imported,
                secret,
            },
        );
        Ok(Vec::new())
    }

    fn private_key_operation(&mut self, algorithm: u8, slot: u8, data: &[u8]) -> Outcome {
        let entry = self.slots.get(&slot).ok_or(INCORRECT_DATA)?;
        if algorithm != P256_ID {
            return Err(INCORRECT_DATA);
        }
        let secret = entry.secret.clone();
        match entry.pin_policy {
            PinPolicy::Never => {}
            PinPolicy::Always => {
                if !self.pin_always_ready {
                    return Err(SECURITY_STATUS);
                }
                self.pin_always_ready = false;
            }
            _ => {
                if !self.pin_verified {
                    return Err(SECURITY_STATUS);
                }
            }
        }

        let items = dynamic_auth(data).ok_or(INCORRECT_DATA)?;
        if let Some(digest) = find(&items, 0x81) {
            let signature: EcdsaSignature = SigningKey::from(&secret)
                .sign_prehash_with_rng(&mut rand_v8::thread_rng(), digest)
                .map_err(|_| INCORRECT_DATA)?;
            return Ok(dynamic_auth_reply(0x82, signature.to_der().as_bytes()));
        }
        if let Some(point) = find(&items, 0x85) {
            let peer = P256PublicKey::from_sec1_bytes(point).map_err(|_| INCORRECT_DATA)?;
            let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
            return Ok(dynamic_auth_reply(0x82, shared.raw_secret_bytes()));
        }
        Err(INCORRECT_DATA)
    }

    fn get_data(&mut self, data: &[u8]) -> Outcome {
        let [0x5C, 0x03, a, b, c] = data else {
            return Err(INCORRECT_DATA);
        };
        let id = u32::from_be_bytes([0, *a, *b, *c]);
        if id == objects::PRINTED && !self.pin_verified {
            return Err(SECURITY_STATUS);
        }
        self.objects.get(&id).cloned().ok_or(NOT_FOUND)
    }

    fn put_data(&mut self, data: &[u8]) -> Outcome {
        self.require_management_key()?;
        let [0x5C, 0x03, a, b, c, rest @ ..] = data else {
            return Err(INCORRECT_DATA);
        };
        let id = u32::from_be_bytes([0, *a, *b, *c]);
        let (tag, value, trailing) = split_tlv(rest).ok_or(INCORRECT_DATA)?;
        if tag != [0x53] || !trailing.is_empty() {
            return Err(INCORRECT_DATA);
        }
        if value.is_empty() {
            self.objects.remove(&id);
        } else {
            self.objects.insert(id, rest.to_vec());
        }
        Ok(Vec::new())
    }

    fn metadata(&mut self, reference: u8) -> Outcome {
        self.require_version(FirmwareVersion::new(5, 3, 0))?;
        let mut out = Vec::new();
        match reference {
            0x80 | 0x81 => {
                let counter = if reference == 0x80 { &self.pin } else { &self.puk };
                write_tlv(&mut out, &[0x05], &[u8::from(counter.is_default)]);
                write_tlv(&mut out, &[0x06], &[counter.max, counter.remaining]);
            }
            0x9B => {
                write_tlv(&mut out, &[0x01], &[self.management_key.algorithm().id()]);
                write_tlv(&mut out, &[0x02], &[0x00, self.management_touch.to_byte()]);
                write_tlv(&mut out, &[0x05], &[u8::from(self.management_default)]);
            }
            slot => {
                let entry = self.slots.get(&slot).ok_or(REFERENCE_NOT_FOUND)?;
                let mut public_key = Vec::new();
                write_tlv(&mut public_key, &[0x86], &entry.point());
                write_tlv(&mut out, &[0x01], &[P256_ID]);
                write_tlv(
                    &mut out,
                    &[0x02],
                    &[entry.pin_policy.to_byte(), entry.touch_policy.to_byte()],
                );
                write_tlv(&mut out, &[0x03], &[entry.origin.to_byte()]);
                write_tlv(&mut out, &[0x04], &public_key);
            }
        }
        Ok(out)
    }

    fn attest(&mut self, slot: u8) -> Outcome {
        self.require_version(FirmwareVersion::new(4, 3, 0))?;
        match self.slots.get(&slot) {
            Some(entry) if entry.origin == KeyStatus::Generated => {
                let mut certificate = Vec::new();
                write_tlv(&mut certificate, &[0x30], &entry.point());
                Ok(certificate)
            }
            _ => Err(INCORRECT_DATA),
        }
    }

    /// Send `payload`, leaving anything beyond one reply for GET RESPONSE
    fn send(&mut self, mut payload: Vec<u8>) -> Bytes {
        if payload.len() <= RESPONSE_CHUNK {
            return reply(payload, SUCCESS);
        }
        self.outgoing = payload.split_off(RESPONSE_CHUNK);
        let remaining = self.outgoing.len();
        let status = 0x6100 | if remaining >= 256 { 0 } else { remaining as u16 };
        reply(payload, status)
    }
}

impl CardTransport for SimulatedToken {
    fn do_transmit_raw(&mut self, raw: &[u8]) -> Result<Bytes, TransportError> {
        let scheduled = match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                true
            }
            Some(count) => {
                self.fail_after = Some(count - 1);
                false
            }
            None => false,
        };
        if scheduled || self.fail_next > 0 {
            self.fail_next = self.fail_next.saturating_sub(usize::from(!scheduled));
            self.chain.clear();
            self.outgoing.clear();
            return Err(TransportError::Transmission);
        }

        let Ok(command) = Command::from_bytes(raw) else {
            return Ok(reply(Vec::new(), 0x6700));
        };
        self.instructions.push(command.ins);
        let data = command.data.as_deref().unwrap_or_default();

        if command.cla & CLA_CHAINING != 0 {
            self.chain.extend_from_slice(data);
            return Ok(reply(Vec::new(), SUCCESS));
        }
        let mut full = std::mem::take(&mut self.chain);
        full.extend_from_slice(data);
        if command.ins != ins::GET_RESPONSE {
            self.outgoing.clear();
        }

        Ok(match self.handle(&command, &full) {
            Ok(payload) => self.send(payload),
            Err(status) => reply(Vec::new(), status),
        })
    }

    fn is_connected(&self) -> bool {
        true
    }

    /// Card reset: security status is lost, stored state survives
    fn reset(&mut self) -> Result<(), TransportError> {
        self.chain.clear();
        self.outgoing.clear();
        self.forget_pin();
        self.authenticated = false;
        self.pending = PendingAuth::Idle;
        Ok(())
    }
}

fn reply(mut payload: Vec<u8>, status: u16) -> Bytes {
    payload.extend_from_slice(&status.to_be_bytes());
    Bytes::from(payload)
}

fn random(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand_v8::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn write_tlv(out: &mut Vec<u8>, tag: &[u8], value: &[u8]) {
    out.extend_from_slice(tag);
    match value.len() {
        len @ 0..=0x7F => out.push(len as u8),
        len @ 0x80..=0xFF => out.extend_from_slice(&[0x81, len as u8]),
        len => out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]),
    }
    out.extend_from_slice(value);
}

/// Split the first TLV into `(tag, value, rest)`
fn split_tlv(data: &[u8]) -> Option<(&[u8], &[u8], &[u8])> {
    let tag_len = if *data.first()? & 0x1F == 0x1F { 2 } else { 1 };
    let (len, header) = match *data.get(tag_len)? {
        len @ 0..=0x7F => (usize::from(len), tag_len + 1),
        0x81 => (usize::from(*data.get(tag_len + 1)?), tag_len + 2),
        0x82 => {
            let bytes = data.get(tag_len + 1..tag_len + 3)?;
            (usize::from(bytes[0]) << 8 | usize::from(bytes[1]), tag_len + 3)
        }
        _ => return None,
    };
    let end = header.checked_add(len)?;
    let value = data.get(header..end)?;
    Some((&data[..tag_len], value, &data[end..]))
}

/// Single byte tagged TLVs
fn parse_tlvs(mut data: &[u8]) -> Option<Vec<(u8, Vec<u8>)>> {
    let mut items = Vec::new();
    while !data.is_empty() {
        let (tag, value, rest) = split_tlv(data)?;
        items.push((tag[0], value.to_vec()));
        data = rest;
    }
    Some(items)
}

fn find(items: &[(u8, Vec<u8>)], tag: u8) -> Option<&[u8]> {
    items
        .iter()
        .find(|(found, _)| *found == tag)
        .map(|(_, value)| value.as_slice())
}

fn dynamic_auth(data: &[u8]) -> Option<Vec<(u8, Vec<u8>)>> {
    let (tag, value, _) = split_tlv(data)?;
    if tag != [0x7C] {
        return None;
    }
    parse_tlvs(value)
}

fn dynamic_auth_reply(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut inner = Vec::new();
    write_tlv(&mut inner, &[tag], value);
    let mut out = Vec::new();
    write_tlv(&mut out, &[0x7C], &inner);
    out
}
