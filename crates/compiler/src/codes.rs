//! Stable diagnostic codes for the compiler stages
//!
//! Programs that consume diagnostics key off these, not the message
//! text. The ranges are carved up per stage; see the table in
//! `limit_core::diagnostics`.

// Scanning (E001-E099)
pub const INVALID_CHAR: u16 = 1;
pub const UNTERMINATED_STRING: u16 = 2;
pub const UNTERMINATED_BLOCK_COMMENT: u16 = 3;
pub const INVALID_ESCAPE: u16 = 4;
pub const INVALID_NUMBER: u16 = 5;

// Parsing (E100-E199)
pub const UNEXPECTED_TOKEN: u16 = 100;
pub const MISSING_DELIMITER: u16 = 101;
pub const MALFORMED_TYPE: u16 = 102;
pub const INVALID_EXPRESSION: u16 = 103;

// Semantic (E200-E249)
pub const UNDEFINED_NAME: u16 = 200;
pub const CIRCULAR_IMPORT: u16 = 201;
pub const MODULE_NOT_FOUND: u16 = 202;
pub const TYPE_MISMATCH: u16 = 203;
pub const ARITY_MISMATCH: u16 = 204;
pub const BAD_FIELD: u16 = 205;
pub const NON_EXHAUSTIVE_MATCH: u16 = 206;
pub const UNREACHABLE_PATTERN: u16 = 207;
pub const INVALID_SELF_TYPE: u16 = 208;
pub const INVALID_PROPAGATION: u16 = 209;
pub const MISSING_RETURN: u16 = 210;
pub const ABSTRACT_INSTANTIATION: u16 = 211;
pub const INTERFACE_NOT_IMPLEMENTED: u16 = 212;
pub const INVALID_SUPER: u16 = 213;
pub const DUPLICATE_DEFINITION: u16 = 214;
pub const INIT_NOT_CALLED: u16 = 215;

// Memory (E250-E269)
pub const USE_AFTER_MOVE: u16 = 250;
pub const ESCAPING_REFERENCE: u16 = 251;
pub const DOUBLE_MOVE: u16 = 252;
pub const DESTROYED_VALUE_USED: u16 = 253;
pub const LINEAR_NOT_CONSUMED: u16 = 254;
pub const CAPTURE_CONFLICT: u16 = 255;

// Visibility (E270-E289)
pub const PRIVATE_CLASS_MEMBER: u16 = 270;
pub const PROTECTED_CLASS_MEMBER: u16 = 271;
pub const NON_PUBLIC_MODULE_MEMBER: u16 = 272;

// LIR generation (E500-E599)
pub const REGISTER_TYPE_CONFLICT: u16 = 500;
pub const CFG_MALFORMED: u16 = 501;
