use std::fs;
use std::path::Path;

use tracing::warn;

use crate::config::TransferConfig;
use crate::error::{CoreError, CoreResult};

/// Checks the merged file size against both references: the size the server
/// advertised at probe time and the sum of what the segment files actually
/// held. The assembled size is authoritative; agreement with only the probed
/// size within the loose band is still a rejection.
pub fn verify_output(
    dest: &Path,
    probed: u64,
    assembled: u64,
    config: &TransferConfig,
) -> CoreResult<u64> {
    let actual = fs::metadata(dest)
        .map_err(|err| CoreError::Io(err.to_string()))?
        .len();

    if within(actual, probed, config.strict_size_tolerance)
        || within(actual, assembled, config.strict_size_tolerance)
    {
        if actual != assembled {
            warn!(actual, assembled, "merged size drifted from assembled segment total");
        }
        return Ok(actual);
    }

    if within(actual, assembled, config.loose_size_tolerance) {
        warn!(
            actual,
            probed, assembled, "accepting merged file within loose size tolerance"
        );
        return Ok(actual);
    }

    Err(CoreError::IntegrityMismatch {
        actual,
        probed,
        assembled,
    })
}

fn within(actual: u64, reference: u64, tolerance: f64) -> bool {
    if actual == reference {
        return true;
    }
    if reference == 0 {
        return false;
    }
    let delta = (actual as f64 - reference as f64).abs();
    delta <= reference as f64 * tolerance
}
