/// PIV application identifier (NIST SP 800-73-4)
pub const PIV_AID: &[u8] = b"\xA0\x00\x00\x03\x08";

/// Class byte for every PIV command
pub const CLA: u8 = 0x00;

/// Default PIN on a factory-fresh token
pub const DEFAULT_PIN: &[u8] = b"123456";
/// Default PUK on a factory-fresh token
pub const DEFAULT_PUK: &[u8] = b"12345678";
/// Retry count PIN and PUK start with
pub const DEFAULT_RETRY_COUNT: u8 = 3;

/// Default management key value shared by TripleDES and AES-192
pub const DEFAULT_MANAGEMENT_KEY: [u8; 24] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, //
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, //
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
];

/// PIN and PUK are padded with this byte to eight bytes
pub const PIN_PADDING: u8 = 0xFF;
/// Padded length of a PIN or PUK on the wire
pub const PIN_PADDED_LEN: usize = 8;
/// Shortest PIN or PUK accepted
pub const PIN_MIN_LEN: usize = 6;

/// Salt length stored in the admin data object
pub const PIN_DERIVATION_SALT_LEN: usize = 16;
/// Default PBKDF2 iteration count for PIN-derived management keys
pub const PIN_DERIVATION_ITERATIONS: u32 = 10_000;

pub mod ins {
    //! Instruction bytes

    /// VERIFY
    pub const VERIFY: u8 = 0x20;
    /// CHANGE REFERENCE DATA
    pub const CHANGE_REFERENCE: u8 = 0x24;
    /// RESET RETRY COUNTER
    pub const RESET_RETRY_COUNTER: u8 = 0x2C;
    /// GENERATE ASYMMETRIC KEY PAIR
    pub const GENERATE_ASYMMETRIC: u8 = 0x47;
    /// GENERAL AUTHENTICATE
    pub const GENERAL_AUTHENTICATE: u8 = 0x87;
    /// SELECT
    pub const SELECT: u8 = 0xA4;
    /// GET RESPONSE
    pub const GET_RESPONSE: u8 = 0xC0;
    /// GET DATA
    pub const GET_DATA: u8 = 0xCB;
    /// PUT DATA
    pub const PUT_DATA: u8 = 0xDB;

    // Vendor extensions
    /// GET METADATA
    pub const GET_METADATA: u8 = 0xF7;
    /// GET SERIAL
    pub const GET_SERIAL: u8 = 0xF8;
    /// ATTEST
    pub const ATTEST: u8 = 0xF9;
    /// SET PIN RETRIES
    pub const SET_PIN_RETRIES: u8 = 0xFA;
    /// RESET application
    pub const RESET: u8 = 0xFB;
    /// GET VERSION
    pub const GET_VERSION: u8 = 0xFD;
    /// IMPORT ASYMMETRIC KEY
    pub const IMPORT_KEY: u8 = 0xFE;
    /// SET MANAGEMENT KEY
    pub const SET_MANAGEMENT_KEY: u8 = 0xFF;
}

pub mod key_reference {
    //! P2 references for VERIFY, CHANGE REFERENCE and metadata

    /// PIV application PIN
    pub const PIN: u8 = 0x80;
    /// PIN unblocking key
    pub const PUK: u8 = 0x81;
    /// Card management key
    pub const MANAGEMENT_KEY: u8 = 0x9B;
}

pub mod tags {
    //! BER-TLV tags used in PIV command and response data

    /// Dynamic authentication template
    pub const DYNAMIC_AUTH: u8 = 0x7C;
    /// Witness inside the authentication template
    pub const AUTH_WITNESS: u8 = 0x80;
    /// Challenge inside the authentication template
    pub const AUTH_CHALLENGE: u8 = 0x81;
    /// Response inside the authentication template
    pub const AUTH_RESPONSE: u8 = 0x82;
    /// Exponentiation (key agreement) inside the authentication template
    pub const AUTH_EXPONENTIATION: u8 = 0x85;

    /// Object identifier list in GET/PUT DATA
    pub const OBJECT_ID: u8 = 0x5C;
    /// Object value wrapper in GET/PUT DATA
    pub const OBJECT_DATA: u8 = 0x53;

    /// Generation control template
    pub const GENERATE_TEMPLATE: u8 = 0xAC;
    /// Algorithm inside the generation template
    pub const ALGORITHM: u8 = 0x80;
    /// PIN policy in generate and import data
    pub const PIN_POLICY: u8 = 0xAA;
    /// Touch policy in generate and import data
    pub const TOUCH_POLICY: u8 = 0xAB;

    /// Public key template (two byte tag 7F49)
    pub const PUBLIC_KEY_TEMPLATE: [u8; 2] = [0x7F, 0x49];
    /// RSA modulus inside the public key template
    pub const RSA_MODULUS: u8 = 0x81;
    /// RSA public exponent inside the public key template
    pub const RSA_EXPONENT: u8 = 0x82;
    /// EC point inside the public key template
    pub const EC_POINT: u8 = 0x86;

    /// Certificate inside a certificate object
    pub const CERTIFICATE: u8 = 0x70;
    /// Certificate info byte (compression) inside a certificate object
    pub const CERT_INFO: u8 = 0x71;
    /// Error detection code closing a certificate object
    pub const LRC: u8 = 0xFE;

    /// Admin data template
    pub const ADMIN_DATA: u8 = 0x80;
    /// Admin data flags byte
    pub const ADMIN_FLAGS: u8 = 0x81;
    /// Admin data PBKDF2 salt
    pub const ADMIN_SALT: u8 = 0x82;
    /// Admin data PIN change timestamp
    pub const ADMIN_TIMESTAMP: u8 = 0x83;

    /// Printed data template
    pub const PRINTED_DATA: u8 = 0x88;
    /// Management key inside printed data
    pub const PRINTED_MANAGEMENT_KEY: u8 = 0x89;

    /// Metadata: algorithm
    pub const METADATA_ALGORITHM: u8 = 0x01;
    /// Metadata: PIN and touch policy
    pub const METADATA_POLICY: u8 = 0x02;
    /// Metadata: key origin
    pub const METADATA_ORIGIN: u8 = 0x03;
    /// Metadata: public key
    pub const METADATA_PUBLIC_KEY: u8 = 0x04;
    /// Metadata: credential still has its default value
    pub const METADATA_IS_DEFAULT: u8 = 0x05;
    /// Metadata: total and remaining retries
    pub const METADATA_RETRIES: u8 = 0x06;

    /// Private key import: RSA prime p
    pub const IMPORT_RSA_P: u8 = 0x01;
    /// Private key import: RSA prime q
    pub const IMPORT_RSA_Q: u8 = 0x02;
    /// Private key import: RSA d mod (p - 1)
    pub const IMPORT_RSA_DP: u8 = 0x03;
    /// Private key import: RSA d mod (q - 1)
    pub const IMPORT_RSA_DQ: u8 = 0x04;
    /// Private key import: RSA q^-1 mod p
    pub const IMPORT_RSA_QINV: u8 = 0x05;
    /// Private key import: EC private scalar
    pub const IMPORT_EC_PRIVATE: u8 = 0x06;
    /// Private key import: Ed25519 seed
    pub const IMPORT_ED25519: u8 = 0x07;
    /// Private key import: X25519 scalar
    pub const IMPORT_X25519: u8 = 0x08;
}

pub mod objects {
    //! Data object identifiers

    /// Card holder unique identifier
    pub const CHUID: u32 = 0x5F_C102;
    /// Card capability container
    pub const CAPABILITY: u32 = 0x5F_C107;
    /// Printed information, holds the PIN-protected management key
    pub const PRINTED: u32 = 0x5F_C109;
    /// Vendor admin data, holds PIN-only mode flags and salt
    pub const ADMIN_DATA: u32 = 0x5F_FF00;
    /// Key history object
    pub const KEY_HISTORY: u32 = 0x5F_C10C;
}

/// Admin data flag: PUK is blocked on purpose
pub const ADMIN_FLAG_PUK_BLOCKED: u8 = 0x01;
/// Admin data flag: management key is stored in printed data
pub const ADMIN_FLAG_MGMT_KEY_PROTECTED: u8 = 0x02;
