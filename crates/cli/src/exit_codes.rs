//! CLI exit code registry.
//!
//! Exit codes are part of the shell contract; scripts rely on them.
//!
//! | Code | Meaning                                          |
//! |------|--------------------------------------------------|
//! | 0    | Success                                          |
//! | 1    | Engine or session failure                        |
//! | 2    | Usage error (bad args, unreadable file)          |
//! | 3    | `check` finished and found invalid cells         |
//! | 4    | Engine did not answer in time                    |

use tidygrid_client::ClientError;

/// Command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// Engine fault, protocol error or session misuse.
pub const EXIT_ERROR: u8 = 1;

/// Bad arguments, unknown column, unreadable input.
pub const EXIT_USAGE: u8 = 2;

/// Validation ran to completion and reported violations.
/// Like `diff(1)`, this is a result, not a failure of the tool.
pub const EXIT_INVALID_CELLS: u8 = 3;

/// A call or the ready handshake timed out.
pub const EXIT_TIMEOUT: u8 = 4;

/// Map a client error to its exit code.
pub fn client_exit_code(err: &ClientError) -> u8 {
    match err {
        ClientError::Timeout { .. } => EXIT_TIMEOUT,
        ClientError::ColumnOutOfRange { .. } | ClientError::RowOutOfRange { .. } => EXIT_USAGE,
        _ => EXIT_ERROR,
    }
}
