// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for constants module

use camrig::constants::{PWM_SUPPORTED_FPS, SYNC_RTP_SSRC, sync_threshold_us};

#[test]
fn test_sync_threshold_is_one_frame_period() {
    for fps in PWM_SUPPORTED_FPS {
        let threshold = sync_threshold_us(fps);
        let period = 1_000_000 / u64::from(fps);
        assert!(
            threshold.abs_diff(period) <= 1,
            "threshold {} for {}fps should match the frame period",
            threshold,
            fps
        );
    }
}

#[test]
fn test_threshold_shrinks_with_frame_rate() {
    assert!(sync_threshold_us(60) < sync_threshold_us(30));
    assert!(sync_threshold_us(30) < sync_threshold_us(15));
}

#[test]
fn test_ssrc_spells_dwe() {
    assert_eq!(&SYNC_RTP_SSRC.to_be_bytes()[1..], b"DWE");
}
