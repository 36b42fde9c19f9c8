use lazy_static::lazy_static;
use std::collections::HashMap;

lazy_static! {
    /// Exit codes of the transfer program as reported in `mld_status` state 2.
    static ref MDTM_ERRORS: HashMap<i64, &'static str> = HashMap::from([
        (1, "invalid transfer arguments"),
        (2, "source file not found"),
        (3, "permission denied on source or destination"),
        (4, "destination storage is full"),
        (5, "could not connect to the peer DTN"),
        (6, "data connection timed out"),
        (7, "authentication with the peer DTN failed"),
        (8, "transfer aborted by the peer"),
        (9, "I/O error while reading the source"),
        (10, "I/O error while writing the destination"),
        (11, "transfer program crashed"),
        (12, "transfer cancelled"),
    ]);
}

pub fn describe(code: i64) -> String {
    match MDTM_ERRORS.get(&code) {
        Some(message) => (*message).to_string(),
        None => format!("unknown transfer error (code {})", code),
    }
}
