//! Per-stream state and timeline: chunked ingest, volume shaping, pacing,
//! and flow-control bookkeeping (spec §3, §4.5, §4.8).

use std::collections::VecDeque;
use std::ffi::CString;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::protocol::serde::stream::BufferAttr;
use crate::protocol::{ChannelMap, ChannelVolume, Props, SampleFormat, SampleSpec, Volume};

use super::clock::ClockHandle;
use super::ring::ByteRing;
use super::{CATCHUP_CAP_USEC, UNDERRUN_RESET_USEC};

/// A chunk captured at ingest time, queued for clock-paced dispatch
/// (spec §3, "Pending chunk").
#[derive(Debug)]
pub struct PendingChunk {
    pub audio: Vec<u8>,
    pub start_frame: u64,
    pub frame_count: u64,
    pub from_memfd: bool,
    pub converted_from_float: bool,
    pub catchup_usec: u64,
    pub play_time: Instant,
}

/// Outcome of one clock tick for a single stream (spec §4.9).
pub enum ClockTick {
    /// A chunk was popped, volume-shaped, and is ready to hand to the
    /// timeshift collaborator.
    Delivered {
        rtp_timestamp: u32,
        audio: Vec<u8>,
        play_time: Instant,
    },
    /// No pending chunk; the caller should issue a REQUEST instead of
    /// emitting silence.
    Empty,
    /// The stream is corked; nothing to do.
    Corked,
}

/// Playback latency figures for a `GetPlaybackLatency` reply (spec §4.7).
#[derive(Debug, Clone, Copy)]
pub struct LatencyInfo {
    pub total_usec: u64,
    pub write_index_bytes: i64,
    pub read_index_bytes: i64,
    pub running: bool,
    pub underrun_usec: u64,
    pub playing_for_usec: u64,
}

/// Per-connection stream state keyed by its 32-bit channel index (spec §3).
pub struct Stream {
    pub stream_index: u32,
    pub sink_input_index: u32,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub buffer_attr: BufferAttr,
    pub volume: ChannelVolume,
    pub corked: bool,
    pub muted: bool,
    pub props: Props,
    pub name: Option<CString>,
    pub composite_tag: String,
    pub wildcard_tag: String,
    pub base_tag: String,

    ring: ByteRing,
    pending_chunks: VecDeque<PendingChunk>,

    frame_cursor: u64,
    rtp_base: u32,
    next_rtp_frame: u64,

    last_delivery_time: Option<Instant>,
    underrun_usec: u64,
    started_notified: bool,
    playback_started: bool,
    start_time: Option<Instant>,

    input_frame_bytes: u32,
    chunk_bytes: u32,
    samples_per_chunk: u32,

    request_granularity: u32,
    bytes_since_request: u32,
    pending_request_bytes: u32,

    clock: ClockHandle,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("stream_index", &self.stream_index)
            .field("composite_tag", &self.composite_tag)
            .field("corked", &self.corked)
            .field("frame_cursor", &self.frame_cursor)
            .finish_non_exhaustive()
    }
}

impl Stream {
    /// Derives the chunk-ingest granularity and RTP timeline for a new
    /// stream (spec §4.5 "On Create").
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_index: u32,
        sink_input_index: u32,
        sample_spec: SampleSpec,
        channel_map: ChannelMap,
        buffer_attr: BufferAttr,
        volume: ChannelVolume,
        corked: bool,
        props: Props,
        composite_tag: String,
        wildcard_tag: String,
        base_tag: String,
        default_chunk_bytes: u32,
        clock: ClockHandle,
    ) -> Self {
        let input_frame_bytes = sample_spec.channels as u32 * sample_spec.format.bytes_per_sample() as u32;
        let chunk_bytes = round_up_to_multiple(default_chunk_bytes, input_frame_bytes);
        let samples_per_chunk = chunk_bytes / input_frame_bytes;
        let rtp_base: u32 = rand::rng().random();

        Self {
            stream_index,
            sink_input_index,
            sample_spec,
            channel_map,
            buffer_attr,
            volume,
            corked,
            muted: false,
            props,
            name: None,
            composite_tag,
            wildcard_tag,
            base_tag,
            ring: ByteRing::new(),
            pending_chunks: VecDeque::new(),
            frame_cursor: 0,
            rtp_base,
            next_rtp_frame: rtp_base as u64,
            last_delivery_time: None,
            underrun_usec: 0,
            started_notified: false,
            playback_started: false,
            start_time: None,
            input_frame_bytes,
            chunk_bytes,
            samples_per_chunk,
            request_granularity: chunk_bytes.max(1),
            bytes_since_request: 0,
            pending_request_bytes: 0,
            clock,
        }
    }

    pub fn initial_request_bytes(&self) -> u32 {
        self.chunk_bytes
    }

    /// Number of clock ticks this stream hasn't yet consumed via
    /// [`Stream::on_clock_tick`] (spec §4.9).
    pub fn ticks_elapsed(&mut self) -> u64 {
        self.clock.ticks_elapsed()
    }

    /// Appends freshly-received playback bytes and slices off every
    /// complete chunk, converting to the S32LE-normalized representation
    /// and computing each chunk's pacing (spec §4.5 "On ingest").
    ///
    /// Returns `true` if this ingest made the first chunk of an uncorked
    /// burst available, meaning the caller should emit `Started`.
    pub fn ingest(&mut self, data: &[u8], now: Instant) -> bool {
        self.ingest_inner(data, now, false)
    }

    /// Same as [`Stream::ingest`] but for a chunk read from a registered
    /// memfd block (spec §4.4/§4.9's `from_memfd` bookkeeping).
    pub fn ingest_memfd_block(&mut self, data: &[u8], now: Instant) -> bool {
        self.ingest_inner(data, now, true)
    }

    fn ingest_inner(&mut self, data: &[u8], now: Instant, from_memfd: bool) -> bool {
        self.ring.write(data);

        let mut became_startable = false;
        while self.ring.size() >= self.chunk_bytes as usize {
            let mut raw = vec![0u8; self.chunk_bytes as usize];
            let n = self.ring.pop(&mut raw);
            debug_assert_eq!(n, raw.len());

            let audio = convert_to_s32(&raw, self.sample_spec.format);
            let frame_count = self.samples_per_chunk as u64;
            let start_frame = self.frame_cursor;
            self.frame_cursor += frame_count;

            let (play_time, catchup_usec) = self.pace(now, frame_count);

            let was_empty = self.pending_chunks.is_empty();
            self.pending_chunks.push_back(PendingChunk {
                audio,
                start_frame,
                frame_count,
                from_memfd,
                converted_from_float: matches!(self.sample_spec.format, SampleFormat::Float32Le),
                catchup_usec,
                play_time,
            });

            if was_empty && !self.corked && !self.started_notified {
                self.started_notified = true;
                self.playback_started = true;
                self.start_time.get_or_insert(now);
                became_startable = true;
            }
        }

        became_startable
    }

    fn pace(&mut self, now: Instant, frame_count: u64) -> (Instant, u64) {
        let mut last = *self.last_delivery_time.get_or_insert(now);
        let mut catchup_usec = 0;

        if last < now {
            let gap = now.duration_since(last);
            self.underrun_usec += gap.as_micros() as u64;

            if gap > Duration::from_micros(UNDERRUN_RESET_USEC) {
                last = now;
            } else {
                let cap = Duration::from_micros(CATCHUP_CAP_USEC).min(gap);
                catchup_usec = cap.as_micros() as u64;
                last += cap;
            }
        }

        let play_time = last;
        let chunk_duration =
            Duration::from_secs_f64(frame_count as f64 / self.sample_spec.sample_rate as f64);
        self.last_delivery_time = Some(last + chunk_duration);

        (play_time, catchup_usec)
    }

    /// Runs one clock tick for this stream (spec §4.9).
    pub fn on_clock_tick(&mut self) -> ClockTick {
        if self.corked {
            return ClockTick::Corked;
        }

        let Some(mut chunk) = self.pending_chunks.pop_front() else {
            return ClockTick::Empty;
        };

        let rtp_timestamp = (self.rtp_base as u64)
            .wrapping_add(chunk.start_frame)
            .rem_euclid(1u64 << 32) as u32;
        self.next_rtp_frame = (self.rtp_base as u64) + chunk.start_frame + chunk.frame_count;

        apply_volume(&mut chunk.audio, &self.volume, self.muted);

        self.bytes_since_request += self.chunk_bytes;
        while self.bytes_since_request >= self.request_granularity {
            self.bytes_since_request -= self.request_granularity;
            self.pending_request_bytes += self.request_granularity;
        }

        ClockTick::Delivered {
            rtp_timestamp,
            audio: chunk.audio,
            play_time: chunk.play_time,
        }
    }

    /// Drains any REQUEST backlog accumulated since the last call.
    pub fn take_pending_request_bytes(&mut self) -> u32 {
        std::mem::take(&mut self.pending_request_bytes)
    }

    pub fn next_rtp_frame(&self) -> u64 {
        self.next_rtp_frame
    }

    /// Corks the stream: suspends REQUEST generation and clears pacing,
    /// but preserves buffered data (spec §4.7 "CorkPlaybackStream").
    pub fn cork(&mut self) {
        self.corked = true;
        self.started_notified = false;
        self.playback_started = false;
        self.last_delivery_time = None;
    }

    /// Uncorks the stream, resets pacing, and reports whether `Started`
    /// should be emitted because chunks are already pending.
    pub fn uncork(&mut self) -> bool {
        self.corked = false;
        self.last_delivery_time = None;
        self.started_notified = false;

        let should_start = !self.pending_chunks.is_empty();
        if should_start {
            self.started_notified = true;
            self.playback_started = true;
        }
        should_start
    }

    /// Drops all buffered and pending data and resets pacing (spec §4.7
    /// "FlushPlaybackStream").
    pub fn flush(&mut self) {
        self.ring.clear();
        self.pending_chunks.clear();
        self.last_delivery_time = None;
        self.bytes_since_request = 0;
        self.pending_request_bytes = self.chunk_bytes;
    }

    /// Computes the latency figures for a `GetPlaybackLatency` reply
    /// (spec §4.7).
    pub fn playback_latency(&self, now: Instant) -> LatencyInfo {
        let bytes_per_frame = self.sample_spec.channels as u64 * 4;

        let converted_usec = self
            .last_delivery_time
            .map(|last| last.saturating_duration_since(now).as_micros() as u64)
            .unwrap_or(0);

        let pending_usec = if self.sample_spec.sample_rate > 0 {
            (self.ring.size() as u64 * 1_000_000)
                / (self.input_frame_bytes.max(1) as u64 * self.sample_spec.sample_rate as u64)
        } else {
            0
        };

        let total_usec = converted_usec + pending_usec;
        let buffered_frames = (converted_usec * self.sample_spec.sample_rate as u64) / 1_000_000;

        let write_index_bytes = (self.frame_cursor * bytes_per_frame) as i64;
        let read_index_bytes =
            (self.frame_cursor.saturating_sub(buffered_frames) * bytes_per_frame) as i64;

        let playing_for_usec = self
            .start_time
            .map(|start| now.saturating_duration_since(start).as_micros() as u64)
            .unwrap_or(0);

        LatencyInfo {
            total_usec,
            write_index_bytes,
            read_index_bytes,
            running: self.playback_started && !self.corked,
            underrun_usec: self.underrun_usec,
            playing_for_usec,
        }
    }

    pub fn buffered_ring_bytes(&self) -> usize {
        self.ring.size()
    }
}

fn round_up_to_multiple(value: u32, multiple: u32) -> u32 {
    if multiple == 0 {
        return value;
    }
    let remainder = value % multiple;
    if remainder == 0 {
        value
    } else {
        value + (multiple - remainder)
    }
}

/// Converts one chunk of raw wire bytes into the S32LE-normalized
/// representation all downstream packets carry (spec §4.5, §6).
fn convert_to_s32(raw: &[u8], format: SampleFormat) -> Vec<u8> {
    match format {
        SampleFormat::S32Le => raw.to_vec(),
        SampleFormat::S16Le => raw
            .chunks_exact(2)
            .flat_map(|sample| {
                let s16 = i16::from_le_bytes([sample[0], sample[1]]);
                ((s16 as i32) << 16).to_le_bytes()
            })
            .collect(),
        SampleFormat::Float32Le => raw
            .chunks_exact(4)
            .flat_map(|sample| {
                let f = f32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                let clamped = f.clamp(-1.0, 1.0);
                let s16 = (clamped * 32767.0) as i16;
                ((s16 as i32) << 16).to_le_bytes()
            })
            .collect(),
        other => {
            log::warn!(target: "screamroute_pulse::stream", "unexpected sample format {other:?} reached S32 conversion");
            raw.to_vec()
        }
    }
}

/// Applies per-channel volume/mute shaping in place on S32LE samples
/// (spec §4.5 "Volume/mute").
fn apply_volume(audio: &mut [u8], volume: &ChannelVolume, muted: bool) {
    if muted {
        audio.fill(0);
        return;
    }

    let gains: Vec<f32> = volume
        .channels()
        .iter()
        .map(|v| shape_gain(v.as_u32() as f32 / Volume::NORM.as_u32() as f32))
        .collect();

    if gains.is_empty() || gains.iter().all(|g| (g - 1.0).abs() < 1e-6) {
        return;
    }

    let channels = gains.len();
    for (i, sample) in audio.chunks_exact_mut(4).enumerate() {
        let gain = gains[i % channels];
        let value = i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
        let scaled = (value as f64 * gain as f64).clamp(i32::MIN as f64, i32::MAX as f64) as i32;
        sample.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// The perceptual low-end shaping curve (spec §4.5): `g^2.5` below unity,
/// identity at/above unity, clamped to 0 below.
fn shape_gain(g: f32) -> f32 {
    if g <= 0.0 {
        0.0
    } else if g < 1.0 {
        g.powf(2.5)
    } else {
        g
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelMap;
    use crate::server::clock::ClockSource;

    fn test_stream(format: SampleFormat) -> Stream {
        Stream::new(
            1,
            1,
            SampleSpec {
                format,
                channels: 2,
                sample_rate: 48000,
            },
            ChannelMap::stereo(),
            BufferAttr::default(),
            ChannelVolume::norm(2),
            false,
            Props::new(),
            "peer app#000000".to_owned(),
            "peer app#000000*".to_owned(),
            "peer app".to_owned(),
            1152,
            ClockSource::new().handle(),
        )
    }

    #[test]
    fn chunk_bytes_round_to_frame_multiple() {
        let stream = test_stream(SampleFormat::S16Le);
        // frame_bytes = 2 channels * 2 bytes = 4; 1152 is already a multiple.
        assert_eq!(stream.chunk_bytes, 1152);
        assert_eq!(stream.samples_per_chunk, 288);
    }

    #[test]
    fn ingest_emits_started_on_first_chunk_only() {
        let mut stream = test_stream(SampleFormat::S16Le);
        let now = Instant::now();

        let data = vec![0u8; 1152];
        assert!(stream.ingest(&data, now));
        assert!(!stream.ingest(&data, now));
    }

    #[test]
    fn ingest_converts_s16_to_widened_s32() {
        let mut stream = test_stream(SampleFormat::S16Le);
        let now = Instant::now();

        let mut data = vec![0u8; 1152];
        data[0..2].copy_from_slice(&1i16.to_le_bytes());
        stream.ingest(&data, now);

        match stream.on_clock_tick() {
            ClockTick::Delivered { audio, .. } => {
                let first = i32::from_le_bytes([audio[0], audio[1], audio[2], audio[3]]);
                assert_eq!(first, 1 << 16);
            }
            _ => panic!("expected a delivered chunk"),
        }
    }

    #[test]
    fn corked_stream_does_not_dispatch() {
        let mut stream = test_stream(SampleFormat::S16Le);
        stream.cork();
        stream.ingest(&vec![0u8; 1152], Instant::now());
        assert!(matches!(stream.on_clock_tick(), ClockTick::Corked));
    }

    #[test]
    fn empty_queue_requests_without_silence() {
        let mut stream = test_stream(SampleFormat::S16Le);
        assert!(matches!(stream.on_clock_tick(), ClockTick::Empty));
    }

    #[test]
    fn rtp_timestamp_wraps_modulo_2_32() {
        let mut stream = test_stream(SampleFormat::S16Le);
        stream.rtp_base = u32::MAX - 10;
        stream.frame_cursor = 0;
        stream.ingest(&vec![0u8; 1152 * 2], Instant::now());

        let first = match stream.on_clock_tick() {
            ClockTick::Delivered { rtp_timestamp, .. } => rtp_timestamp,
            _ => panic!("expected delivery"),
        };
        assert_eq!(first, u32::MAX - 10);

        let second = match stream.on_clock_tick() {
            ClockTick::Delivered { rtp_timestamp, .. } => rtp_timestamp,
            _ => panic!("expected delivery"),
        };
        // 288 frames later, base + 288 wraps past u32::MAX.
        assert_eq!(second, ((u32::MAX as u64 - 10 + 288) % (1u64 << 32)) as u32);
    }

    #[test]
    fn underrun_past_reset_threshold_snaps_instead_of_capping() {
        let mut stream = test_stream(SampleFormat::S16Le);
        let t0 = Instant::now();
        stream.ingest(&vec![0u8; 1152], t0);

        let t1 = t0 + Duration::from_millis(800);
        stream.ingest(&vec![0u8; 1152], t1);

        assert!(stream.underrun_usec >= 800_000 - 1000);
    }

    #[test]
    fn mute_zeroes_the_whole_chunk() {
        let mut stream = test_stream(SampleFormat::S16Le);
        stream.muted = true;
        let mut data = vec![0u8; 1152];
        data[0..2].copy_from_slice(&100i16.to_le_bytes());
        stream.ingest(&data, Instant::now());

        match stream.on_clock_tick() {
            ClockTick::Delivered { audio, .. } => assert!(audio.iter().all(|&b| b == 0)),
            _ => panic!("expected delivery"),
        }
    }

    #[test]
    fn shape_gain_matches_perceptual_curve() {
        assert_eq!(shape_gain(0.0), 0.0);
        assert_eq!(shape_gain(1.0), 1.0);
        assert_eq!(shape_gain(2.0), 2.0);
        assert!((shape_gain(0.5) - 0.5f32.powf(2.5)).abs() < 1e-6);
    }

    #[test]
    fn unity_volume_skips_scaling_entirely() {
        let mut stream = test_stream(SampleFormat::S16Le);
        let mut data = vec![0u8; 1152];
        data[0..2].copy_from_slice(&12345i16.to_le_bytes());
        stream.ingest(&data, Instant::now());

        match stream.on_clock_tick() {
            ClockTick::Delivered { audio, .. } => {
                let first = i32::from_le_bytes([audio[0], audio[1], audio[2], audio[3]]);
                assert_eq!(first, (12345i32) << 16);
            }
            _ => panic!("expected delivery"),
        }
    }

    #[test]
    fn flush_drops_buffered_and_pending_data() {
        let mut stream = test_stream(SampleFormat::S16Le);
        stream.ingest(&vec![0u8; 1152 + 10], Instant::now());
        assert!(stream.buffered_ring_bytes() > 0);

        stream.flush();
        assert_eq!(stream.buffered_ring_bytes(), 0);
        assert!(matches!(stream.on_clock_tick(), ClockTick::Empty));
    }
}
