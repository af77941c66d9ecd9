//! Property-based tests using proptest
//!
//! These tests validate wire-format invariants across randomly generated
//! bodies, signatures and byte streams.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use dbus_wire::core::codec::MessageCodec;
use dbus_wire::core::marshal::{Endian, Marshaller};
use dbus_wire::core::message::{frame_length, Message};
use dbus_wire::core::signature::SignatureTree;
use dbus_wire::core::unmarshal::Unmarshaller;
use dbus_wire::core::value::Value;
use dbus_wire::protocol::validators::{is_member_name_valid, is_object_path_valid};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn call_with(serial: u32, text: String, numbers: Vec<u32>) -> Message {
    Message::method_call("/org/example/obj", "Store")
        .destination("org.example.Store")
        .interface("org.example.Store")
        .serial(serial)
        .signature("sau")
        .body(vec![
            Value::Str(text),
            Value::Array(numbers.into_iter().map(Value::UInt32).collect()),
        ])
        .build()
        .unwrap()
}

fn endian() -> impl Strategy<Value = Endian> {
    prop_oneof![Just(Endian::Little), Just(Endian::Big)]
}

// Property: a message decodes to the header and body it was built from, in either byte order
proptest! {
    #[test]
    fn prop_message_bytes_decode_to_same_body(
        serial in 1u32..,
        text in "\\PC{0,64}",
        numbers in prop::collection::vec(any::<u32>(), 0..64),
        endian in endian(),
    ) {
        let message = call_with(serial, text, numbers);
        let bytes = message.to_bytes(endian).unwrap();

        prop_assert_eq!(frame_length(&bytes, usize::MAX).unwrap(), Some(bytes.len()));
        let decoded = Message::from_bytes(&bytes).unwrap().unwrap();
        prop_assert_eq!(decoded.serial(), serial);
        prop_assert_eq!(decoded.signature(), "sau");
        prop_assert_eq!(decoded.body(), message.body());
    }
}

// Property: decoding arbitrary bytes returns an error or a message, never panics
proptest! {
    #[test]
    fn prop_decode_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = frame_length(&data, 1 << 20);
        let _ = Message::from_bytes(&data);
        let mut codec = MessageCodec::new().with_max_message_size(1 << 20);
        let mut buf = BytesMut::from(&data[..]);
        let _ = codec.decode(&mut buf);
    }
}

// Property: the codec yields the same messages however the stream is split
proptest! {
    #[test]
    fn prop_codec_resumes_across_splits(
        texts in prop::collection::vec("[a-z]{0,40}", 1..6),
        split in any::<prop::sample::Index>(),
    ) {
        let mut codec = MessageCodec::new();
        let mut stream = BytesMut::new();
        for (i, text) in texts.iter().enumerate() {
            codec.encode(call_with(i as u32 + 1, text.clone(), vec![i as u32]), &mut stream).unwrap();
        }
        let at = split.index(stream.len() + 1);

        let mut buf = BytesMut::from(&stream[..at]);
        let mut decoded = Vec::new();
        while let Some(message) = codec.decode(&mut buf).unwrap() {
            decoded.push(message);
        }
        buf.extend_from_slice(&stream[at..]);
        while let Some(message) = codec.decode(&mut buf).unwrap() {
            decoded.push(message);
        }

        prop_assert!(buf.is_empty());
        prop_assert_eq!(decoded.len(), texts.len());
        for (message, text) in decoded.iter().zip(&texts) {
            prop_assert_eq!(message.body()[0].as_str(), Some(text.as_str()));
        }
    }
}

// Property: parsing a signature never panics, and accepted ones render back unchanged
proptest! {
    #[test]
    fn prop_signature_parse_total(sig in "[ybnqiuxtdsogvah(){}]{0,24}") {
        if let Ok(tree) = SignatureTree::parse(&sig) {
            prop_assert_eq!(tree.as_str(), sig.as_str());
            let rendered: String = tree.types().iter().map(|t| t.signature()).collect();
            prop_assert_eq!(rendered, sig);
        }
    }
}

// Property: every 8-byte value lands on an 8-byte boundary after any prefix
proptest! {
    #[test]
    fn prop_alignment_after_odd_prefix(
        prefix in prop::collection::vec(any::<u8>(), 0..16),
        value in any::<u64>(),
        endian in endian(),
    ) {
        let signature = format!("{}t", "y".repeat(prefix.len()));
        let tree = SignatureTree::parse(&signature).unwrap();
        let mut body: Vec<Value> = prefix.iter().copied().map(Value::Byte).collect();
        body.push(Value::UInt64(value));

        let mut marshaller = Marshaller::new(endian);
        marshaller.write_body(&tree, &body).unwrap();
        let bytes = marshaller.into_inner();
        let aligned = (prefix.len() + 7) / 8 * 8;
        prop_assert_eq!(bytes.len(), aligned + 8);

        let decoded = Unmarshaller::new(&bytes, endian).read_body(&tree).unwrap();
        prop_assert_eq!(decoded, body);
    }
}

// Property: joined valid elements form valid paths; a trailing slash never does
proptest! {
    #[test]
    fn prop_object_path_grammar(elements in prop::collection::vec("[A-Za-z0-9_]{1,8}", 1..6)) {
        let path = format!("/{}", elements.join("/"));
        prop_assert!(is_object_path_valid(&path));
        let trailing = format!("{path}/");
        prop_assert!(!is_object_path_valid(&trailing));
        let doubled = path.replacen('/', "//", 1);
        prop_assert!(!is_object_path_valid(&doubled));
    }
}

// Property: member names never start with a digit
proptest! {
    #[test]
    fn prop_member_names_reject_leading_digit(digit in 0u8..10, rest in "[A-Za-z_]{0,10}") {
        let name = format!("{digit}{rest}");
        prop_assert!(!is_member_name_valid(&name));
        let prefixed = format!("M{name}");
        prop_assert!(is_member_name_valid(&prefixed));
    }
}
