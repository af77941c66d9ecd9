#![no_main]

use bytes::BytesMut;
use dbus_wire::core::codec::MessageCodec;
use dbus_wire::core::message::Message;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Frame decoding must reject malformed input without panicking
    let _ = Message::from_bytes(data);

    let mut codec = MessageCodec::new().with_max_message_size(1 << 20);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
