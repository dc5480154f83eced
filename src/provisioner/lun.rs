//! LUN allocation
//!
//! LUNs are a daemon-wide resource. The next LUN is the lowest non-negative
//! number no export uses, re-derived from the daemon on every call.
//!
//! Listing and the later export creation are not atomic; two provisioners
//! racing against one daemon can pick the same LUN. The controller loop
//! handles one claim at a time for that reason.

use crate::domain::ports::TargetdApi;
use crate::error::Result;
use crate::targetd::Export;
use std::collections::BTreeSet;

/// Lowest LUN not used by any of `exports`
pub fn first_free_lun(exports: &[Export]) -> i32 {
    let luns: BTreeSet<i32> = exports
        .iter()
        .map(|e| e.lun)
        .filter(|lun| *lun >= 0)
        .collect();

    // Sorted and distinct, so the first value above its index marks a gap
    for (index, lun) in luns.iter().enumerate() {
        let index = index as i32;
        if index < *lun {
            return index;
        }
    }

    luns.len() as i32
}

/// Fetch the daemon's exports and pick the next free LUN
pub async fn next_lun(targetd: &dyn TargetdApi) -> Result<i32> {
    let exports = targetd.list_exports().await?;
    Ok(first_free_lun(&exports))
}
