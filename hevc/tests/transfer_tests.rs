//! Raw and encoded stream transfers against the simulated board

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{eventually, fast_config, open, Harness};
use morpheus_hevc::{
    Direction, EhCommand, EncodeMode, FirmwareType, HevcConfig, HevcError, InterfaceState,
    MainStateCommand, SegmentLayout, TransferPayload, TransferResult, VinCommand, ALL_STREAMS,
};
use tracing_test::traced_test;

fn encoding(config: HevcConfig) -> Harness {
    let h = open(config);
    h.device
        .set_main_state(MainStateCommand::Encode {
            mode: EncodeMode::MultiChannel,
            firmware: FirmwareType::Standard,
        })
        .unwrap();
    h.device.set_vin_state(VinCommand::Start, ALL_STREAMS).unwrap();
    h.device.set_eh_state(EhCommand::Start, ALL_STREAMS).unwrap();
    h
}

fn raw(h: &Harness, stream_id: usize, size: usize) -> Result<TransferResult, HevcError> {
    let video = vec![0x5a; size];
    h.device.submit_transfer(
        stream_id,
        TransferPayload::Raw {
            video: &video,
            info: &[1; 16],
            last_frame: false,
            segment: None,
        },
    )
}

fn encoded(h: &Harness, stream_id: usize) -> Result<TransferResult, HevcError> {
    let mut video = vec![0u8; 0x10000];
    let mut info = vec![0u8; 256];
    h.device.submit_transfer(
        stream_id,
        TransferPayload::Encoded {
            video: &mut video,
            info: &mut info,
            segment: None,
        },
    )
}

#[test]
fn test_raw_then_encoded_frame() {
    let h = encoding(HevcConfig::for_simulation());

    let input = raw(&h, 0, 4096).unwrap();
    assert_eq!(input.video_size, 4096);
    assert_eq!(input.info_size, 16);
    assert!(input.encode_time > 0);
    assert_eq!(h.device.frame_level(0), 1);

    let output = encoded(&h, 0).unwrap();
    assert_eq!(output.video_size, 0x2000);
    assert_eq!(output.info_size, 64);
    assert!(!output.last_frame);
    // matched with the capture record of the raw frame
    assert_eq!(output.encode_time, input.encode_time);
    assert_eq!(h.device.frame_level(0), 0);

    assert!(eventually(|| h.device.active_buffers(Direction::Vei, 0) == 0));
    assert_eq!(h.device.active_buffers(Direction::Seo, 0), 0);
}

#[test]
fn test_last_access_unit_flagged() {
    let h = encoding(HevcConfig::for_simulation());
    raw(&h, 1, 1024).unwrap();
    h.sim.faults.last_es.store(1, Ordering::SeqCst);
    let output = encoded(&h, 1).unwrap();
    assert!(output.last_frame);
}

#[test]
fn test_segmented_picture_is_packed() {
    let h = encoding(HevcConfig::for_simulation());
    let layout = SegmentLayout {
        user_pitch: 2048,
        codec_pitch: 1024,
        seg_size: 1000,
        seg_count: 4,
    };
    let video = vec![7u8; 3 * 2048 + 1000];
    let result = h
        .device
        .submit_transfer(
            2,
            TransferPayload::Raw {
                video: &video,
                info: &[],
                last_frame: true,
                segment: Some(layout),
            },
        )
        .unwrap();
    assert_eq!(result.video_size, 3 * 1024 + 1000);
}

#[test]
fn test_streams_interleave() {
    let h = encoding(HevcConfig::for_simulation());
    for round in 0..3 {
        for stream_id in 0..4 {
            let r = raw(&h, stream_id, 512 * (stream_id + 1)).unwrap();
            assert_eq!(r.video_size, 512 * (stream_id + 1), "round {}", round);
        }
    }
    for stream_id in 0..4 {
        assert_eq!(h.device.frame_level(stream_id), 3);
    }
}

#[test]
fn test_oversize_picture_rejected() {
    let h = encoding(HevcConfig::for_simulation());
    assert_eq!(raw(&h, 0, 0x10001), Err(HevcError::BadParameter));
    assert_eq!(h.device.active_buffers(Direction::Vei, 0), 0);
    assert_eq!(h.device.get_status().vei.count, 0);
}

#[test]
fn test_unknown_stream_rejected() {
    let h = encoding(HevcConfig::for_simulation());
    assert_eq!(raw(&h, 4, 16), Err(HevcError::BadParameter));
    assert_eq!(encoded(&h, 9), Err(HevcError::BadParameter));
}

#[test]
fn test_transfer_refused_after_fatal_error() {
    let h = encoding(HevcConfig::for_simulation());
    h.sim.raise_fatal();
    assert_eq!(raw(&h, 0, 16), Err(HevcError::BadState));
    h.device.reset_device().unwrap();
    assert!(raw(&h, 0, 16).is_ok());
}

#[test]
fn test_pool_exhausted_while_completions_outstanding() {
    let h = encoding(fast_config(Duration::from_millis(150)));
    h.sim.faults.drop_vei_completions.store(2, Ordering::SeqCst);

    raw(&h, 2, 256).unwrap();
    raw(&h, 2, 256).unwrap();
    assert_eq!(h.device.active_buffers(Direction::Vei, 2), 2);
    assert_eq!(raw(&h, 2, 256), Err(HevcError::Busy));

    // other streams have their own pools
    raw(&h, 3, 256).unwrap();

    h.device.reset_device().unwrap();
    assert_eq!(h.device.active_buffers(Direction::Vei, 2), 0);
}

#[test]
fn test_blocked_acquire_resumes_on_release() {
    let h = encoding(HevcConfig::for_simulation().buffer_timeout(Duration::from_secs(5)));
    h.sim.faults.drop_vei_completions.store(2, Ordering::SeqCst);
    raw(&h, 2, 256).unwrap();
    raw(&h, 2, 256).unwrap();

    let device = Arc::clone(&h.device);
    let blocked = thread::spawn(move || {
        device.submit_transfer(
            2,
            TransferPayload::Raw {
                video: &[3; 256],
                info: &[],
                last_frame: false,
                segment: None,
            },
        )
    });
    thread::sleep(Duration::from_millis(100));
    assert!(!blocked.is_finished());

    h.device.reset_device().unwrap();
    let result = blocked.join().unwrap();
    assert_eq!(result.map(|r| r.video_size), Ok(256));
}

#[test]
fn test_failed_dma_ack_releases_buffer() {
    let h = encoding(HevcConfig::for_simulation());
    h.sim.faults.fail_vei_acks.store(1, Ordering::SeqCst);
    assert_eq!(raw(&h, 0, 1024), Err(HevcError::DmaFailed));
    assert_eq!(h.device.active_buffers(Direction::Vei, 0), 0);
    assert_eq!(h.device.frame_level(0), 0);

    raw(&h, 0, 1024).unwrap();
}

#[test]
fn test_failed_encode_releases_buffer() {
    let h = encoding(HevcConfig::for_simulation());
    raw(&h, 0, 1024).unwrap();
    h.sim.faults.fail_seo_completions.store(1, Ordering::SeqCst);
    assert_eq!(encoded(&h, 0), Err(HevcError::DmaFailed));
    assert_eq!(h.device.active_buffers(Direction::Seo, 0), 0);
}

#[test]
fn test_lost_completion_holds_buffer_until_reset() {
    let h = encoding(fast_config(Duration::from_millis(150)));
    h.sim.faults.drop_seo_completions.store(1, Ordering::SeqCst);
    assert_eq!(encoded(&h, 1), Err(HevcError::Timeout));
    assert_eq!(h.device.active_buffers(Direction::Seo, 1), 1);
    // the single group of the stream is still out
    assert_eq!(encoded(&h, 1), Err(HevcError::Busy));

    h.device.reset_device().unwrap();
    assert_eq!(h.device.active_buffers(Direction::Seo, 1), 0);
    assert!(encoded(&h, 1).is_ok());
}

#[test]
#[traced_test]
fn test_orphan_sweep_reclaims_lost_transfer() {
    let h = encoding(HevcConfig::for_simulation().orphan_distance(2));
    h.sim.faults.drop_vei_completions.store(1, Ordering::SeqCst);

    raw(&h, 0, 128).unwrap();
    assert_eq!(h.device.active_buffers(Direction::Vei, 0), 1);
    raw(&h, 0, 128).unwrap();
    raw(&h, 0, 128).unwrap();

    assert!(logs_contain("orphaned transfer reclaimed"));
    assert!(eventually(|| h.device.active_buffers(Direction::Vei, 0) == 0));
}

#[test]
fn test_capture_message_feeds_frame_queue() {
    let h = encoding(HevcConfig::for_simulation());
    h.sim.post_capture(1, 7);
    assert!(eventually(|| h.device.frame_level(1) == 1));
    assert_eq!(h.device.get_status().streams[1].vif, InterfaceState::Start);

    raw(&h, 1, 64).unwrap();
    let output = encoded(&h, 1).unwrap();
    assert!(output.encode_time > 0);
    assert_eq!(h.device.frame_level(1), 1);
}

#[test]
fn test_debug_info_reports_and_clears_statistics() {
    let h = encoding(HevcConfig::for_simulation());
    raw(&h, 0, 4096).unwrap();
    encoded(&h, 0).unwrap();

    let info = h.device.get_debug_info(ALL_STREAMS, 0);
    assert_eq!(info.raw_stats[0].count, 1);
    assert_eq!(info.raw_stats[0].size.max, 4096);
    assert_eq!(info.enc_stats[0].count, 1);
    assert_eq!(info.enc_stats[0].size.max, 0x2000);
    assert_eq!(info.raw_stats[1].count, 0);
    // command, vei and seo send counters
    assert_eq!(info.continuity[0], 3);
    assert_eq!(info.continuity[3], 1);
    assert_eq!(info.continuity[6], 1);
    assert_eq!(info.status.vei.count, 1);
    assert_eq!(info.status.seo.count, 1);

    let again = h.device.get_debug_info(0, 0);
    assert_eq!(again.raw_stats[0].count, 0);
    assert_eq!(again.enc_stats[0].count, 1);
}

#[test]
fn test_vin_start_clears_frame_queue() {
    let h = encoding(HevcConfig::for_simulation());
    raw(&h, 3, 64).unwrap();
    raw(&h, 3, 64).unwrap();
    assert_eq!(h.device.frame_level(3), 2);
    h.device.set_vin_state(VinCommand::Start, 0b1000).unwrap();
    assert_eq!(h.device.frame_level(3), 0);
}
