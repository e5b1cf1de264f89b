use std::time::Duration;

use wavelink_core::{
    AfskModulator, Frame, FrameType, Modem, BAUD_RATE, MAX_PAYLOAD_SIZE, SAMPLE_RATE,
};

const PING_PAYLOAD: &[u8] = b"Hello from acoustic modem! Testing 1-2-3.";
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_loopback_raw_bytes() {
    let mut modem = Modem::loopback();
    modem.start().unwrap();

    modem.send(PING_PAYLOAD).unwrap();
    let received = modem.receive(RECEIVE_TIMEOUT);

    // trailing pad silence may decode as junk bytes after the data
    assert!(
        received.starts_with(PING_PAYLOAD),
        "received {:02X?}",
        received
    );
}

#[test]
fn test_loopback_ping_frame() {
    let mut modem = Modem::loopback();
    modem.start().unwrap();

    let frame = Frame::data(0, PING_PAYLOAD).unwrap();
    modem.send(&frame.encode()).unwrap();

    let received = modem.receive(RECEIVE_TIMEOUT);
    let decoded = Frame::decode(&received).expect("no frame in received bytes");
    assert_eq!(decoded, frame);
}

#[test]
fn test_ping_frame_wire_time() {
    // at 300 baud a full ping frame is on the order of 1.7 s of audio:
    // ~1.1 s of payload plus preamble/sync/header/CRC overhead
    let frame = Frame::data(0, PING_PAYLOAD).unwrap();
    let wire_bytes = frame.encode().len();

    let mut modulator = AfskModulator::new();
    let samples = modulator.modulate(&frame.encode());
    assert_eq!(samples.len(), wire_bytes * 8 * (SAMPLE_RATE / BAUD_RATE));

    let seconds = samples.len() as f32 / SAMPLE_RATE as f32;
    assert!(
        (1.2..2.5).contains(&seconds),
        "unexpected wire time: {seconds} s"
    );
}

#[test]
fn test_loopback_zero_length_frame() {
    let mut modem = Modem::loopback();
    modem.start().unwrap();

    modem.send(&Frame::ack(3).encode()).unwrap();
    let decoded = Frame::decode(&modem.receive(RECEIVE_TIMEOUT)).unwrap();
    assert_eq!(decoded.frame_type, FrameType::Ack);
    assert_eq!(decoded.sequence, 3);
    assert!(decoded.payload.is_empty());
}

#[test]
fn test_loopback_max_length_frame() {
    let mut modem = Modem::loopback();
    modem.start().unwrap();

    let payload: Vec<u8> = (0..MAX_PAYLOAD_SIZE as u8).collect();
    let frame = Frame::data(7, &payload).unwrap();
    modem.send(&frame.encode()).unwrap();

    let decoded = Frame::decode(&modem.receive(RECEIVE_TIMEOUT)).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn test_loopback_sync_heavy_payload() {
    // payload full of sync and preamble bytes must not desynchronize
    // the scanner once it rides through the audio path
    let mut modem = Modem::loopback();
    modem.start().unwrap();

    let payload = [0x7E; 32];
    let frame = Frame::data(1, &payload).unwrap();
    modem.send(&frame.encode()).unwrap();

    let decoded = Frame::decode(&modem.receive(RECEIVE_TIMEOUT)).unwrap();
    assert_eq!(decoded.payload, payload);
}

#[test]
fn test_loopback_receive_timeout() {
    let mut modem = Modem::loopback();
    modem.start().unwrap();
    assert!(modem.receive(Duration::from_millis(100)).is_empty());
}

#[test]
fn test_consecutive_frames_share_one_modem() {
    let mut modem = Modem::loopback();
    modem.start().unwrap();

    for seq in 0..4u8 {
        let frame = Frame::data(seq, format!("frame number {seq}").as_bytes()).unwrap();
        modem.send(&frame.encode()).unwrap();
        let decoded = Frame::decode(&modem.receive(RECEIVE_TIMEOUT)).unwrap();
        assert_eq!(decoded, frame);
    }
}
