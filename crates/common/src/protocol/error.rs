// Numeric error codes carried on `error` replies. This is the full wire
// code space; clients match on these values.

/// The frame was not valid JSON.
pub const PARSE_ERROR: i32 = 4000;
/// The frame parsed but is not a known request shape.
pub const INVALID_REQUEST: i32 = 4001;
/// A request field failed validation.
pub const INVALID_PARAMS: i32 = 4002;
/// The connection has not completed the hello handshake, or the token was
/// rejected.
pub const UNAUTHENTICATED: i32 = 4003;
/// The addressed document does not exist.
pub const NOT_FOUND: i32 = 4004;
/// A create targeted an id that already exists.
pub const ALREADY_EXISTS: i32 = 4009;
/// A transaction batch was rejected; details name the failing operation.
pub const TRANSACTION_FAILED: i32 = 4022;
/// Unexpected server-side failure.
pub const INTERNAL_ERROR: i32 = 4500;
