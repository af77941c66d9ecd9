// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::error::DbusError;
use crate::protocol::auth::*;
use crate::protocol::introspection::*;
use crate::protocol::names;
use crate::protocol::validators::*;

#[test]
fn test_external_auth_flow_with_fd_negotiation() {
    let mut auth = Authenticator::new(AuthMechanism::External { uid: Some(1000) }, true)
        .expect("External auth should construct");

    // "1000" hex encoded as ASCII
    assert_eq!(auth.initial_request(), "AUTH EXTERNAL 31303030\r\n");

    let step = auth.handle_line("OK 0123456789abcdef\r\n").unwrap();
    assert_eq!(step, AuthStep::Send("NEGOTIATE_UNIX_FD\r\n".into()));
    assert_eq!(auth.guid(), Some("0123456789abcdef"));

    match auth.handle_line("AGREE_UNIX_FD").unwrap() {
        AuthStep::Finished { line, guid, unix_fd } => {
            assert_eq!(line, "BEGIN\r\n");
            assert_eq!(guid, "0123456789abcdef");
            assert!(unix_fd);
        }
        other => panic!("Expected Finished, got {other:?}"),
    }
}

#[test]
fn test_auth_without_fd_begins_immediately() {
    let mut auth = Authenticator::new(AuthMechanism::External { uid: Some(0) }, false).unwrap();
    match auth.handle_line("OK abc").unwrap() {
        AuthStep::Finished { unix_fd, .. } => assert!(!unix_fd),
        other => panic!("Expected Finished, got {other:?}"),
    }
}

#[test]
fn test_empty_initial_response_answers_data() {
    let mut auth = Authenticator::new(AuthMechanism::External { uid: None }, false).unwrap();
    assert_eq!(auth.initial_request(), "AUTH EXTERNAL\r\n");
    assert_eq!(
        auth.handle_line("DATA").unwrap(),
        AuthStep::Send("DATA\r\n".into())
    );
    assert!(matches!(
        auth.handle_line("OK abc").unwrap(),
        AuthStep::Finished { .. }
    ));
}

#[test]
fn test_auth_failures_are_terminal() {
    let mut rejected = Authenticator::new(AuthMechanism::External { uid: Some(1) }, false).unwrap();
    assert!(matches!(
        rejected.handle_line("REJECTED EXTERNAL DBUS_COOKIE_SHA1"),
        Err(DbusError::Auth(_))
    ));

    let mut refused_fd = Authenticator::new(AuthMechanism::External { uid: Some(1) }, true).unwrap();
    refused_fd.handle_line("OK abc").unwrap();
    assert!(matches!(
        refused_fd.handle_line("ERROR not supported"),
        Err(DbusError::Auth(_))
    ));

    let mut garbage = Authenticator::new(AuthMechanism::External { uid: Some(1) }, false).unwrap();
    assert!(garbage.handle_line("HELLO").is_err());

    let mut no_guid = Authenticator::new(AuthMechanism::External { uid: Some(1) }, false).unwrap();
    assert!(no_guid.handle_line("OK").is_err());
}

#[test]
fn test_anonymous_cannot_negotiate_fds() {
    assert!(Authenticator::new(AuthMechanism::Anonymous, true).is_err());
    let auth = Authenticator::new(AuthMechanism::Anonymous, false).unwrap();
    assert_eq!(auth.initial_request(), "AUTH ANONYMOUS\r\n");
}

#[test]
fn test_bus_name_grammar() {
    assert!(is_bus_name_valid("org.example.Service"));
    assert!(is_bus_name_valid("org.example-dash.Service"));
    assert!(is_bus_name_valid(":1.42"));
    assert!(!is_bus_name_valid("org"));
    assert!(!is_bus_name_valid("org..example"));
    assert!(!is_bus_name_valid(".org.example"));
    assert!(!is_bus_name_valid("org.3example"));
    assert!(!is_bus_name_valid(""));
    assert!(!is_bus_name_valid(&format!("a.{}", "b".repeat(MAX_NAME_LEN))));
}

#[test]
fn test_path_interface_member_grammar() {
    assert!(is_object_path_valid("/"));
    assert!(is_object_path_valid("/org/example/Obj_1"));
    assert!(!is_object_path_valid("/org/"));
    assert!(!is_object_path_valid("org/example"));
    assert!(!is_object_path_valid("/org//example"));
    assert!(!is_object_path_valid("/org/ex-ample"));

    assert!(is_interface_name_valid("org.example.Iface"));
    assert!(!is_interface_name_valid("org.example-dash.Iface"));
    assert!(!is_interface_name_valid("single"));

    assert!(is_member_name_valid("Echo"));
    assert!(is_member_name_valid("_private"));
    assert!(!is_member_name_valid("9Lives"));
    assert!(!is_member_name_valid("Has.Dot"));
    assert!(matches!(
        assert_member_name_valid(""),
        Err(DbusError::InvalidMemberName(_))
    ));
}

const SAMPLE: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node name="/com/example/sample_object0">
  <interface name="com.example.SampleInterface0">
    <method name="Frobate">
      <arg name="foo" type="i" direction="in"/>
      <arg name="bar" type="s" direction="out"/>
      <arg name="baz" type="a{us}" direction="out"/>
      <annotation name="org.freedesktop.DBus.Deprecated" value="true"/>
    </method>
    <method name="Bazify">
      <arg name="bar" type="(iiu)"/>
      <arg name="bar" type="v" direction="out"/>
    </method>
    <signal name="Changed">
      <arg name="new_value" type="b"/>
    </signal>
    <property name="Bar" type="y"/>
    <property name="Baz" type="s" access="read"/>
  </interface>
  <node name="child_of_sample_object"/>
  <node name="another_child_of_sample_object"/>
</node>
"#;

#[test]
fn test_introspection_parse() {
    let node = Node::parse(SAMPLE).unwrap();
    assert_eq!(node.name.as_deref(), Some("/com/example/sample_object0"));
    assert_eq!(node.nodes.len(), 2);

    let iface = node.interface("com.example.SampleInterface0").unwrap();
    let frobate = iface.method("Frobate").unwrap();
    assert_eq!(frobate.in_signature(), "i");
    assert_eq!(frobate.out_signature(), "sa{us}");

    // direction defaults to "in" for method args
    let bazify = iface.method("Bazify").unwrap();
    assert_eq!(bazify.in_signature(), "(iiu)");
    assert_eq!(bazify.out_signature(), "v");

    let changed = iface.signal("Changed").unwrap();
    assert_eq!(changed.signature(), "b");
    assert_eq!(changed.args[0].direction, ArgDirection::Out);

    assert_eq!(iface.property("Bar").unwrap().access, PropertyAccess::ReadWrite);
    assert_eq!(iface.property("Baz").unwrap().access, PropertyAccess::Read);
}

#[test]
fn test_introspection_roundtrip() {
    let node = Node::parse(SAMPLE).unwrap();
    let xml = node.to_xml().unwrap();
    assert!(xml.starts_with(DOCTYPE));
    assert_eq!(Node::parse(&xml).unwrap(), node);
}

#[test]
fn test_introspection_errors() {
    assert!(matches!(
        Node::parse("<interface name=\"a.b\"/>"),
        Err(DbusError::InvalidIntrospection(_))
    ));
    assert!(Node::parse("<node><node/></node>").is_err());
    assert!(Node::parse("<node><interface/></node>").is_err());
    assert!(Node::parse(
        "<node><interface name=\"a.b\"><property name=\"P\" type=\"ii\"/></interface></node>"
    )
    .is_err());
    assert!(Node::parse(
        "<node><interface name=\"a.b\"><method name=\"M\"><arg type=\"i\" direction=\"sideways\"/></method></interface></node>"
    )
    .is_err());
    assert!(Node::parse("").is_err());
}

#[test]
fn test_standard_interfaces() {
    let node = Node::with_standard_interfaces(None).unwrap();
    let names: Vec<_> = node.interfaces.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, names::STANDARD_INTERFACES.to_vec());

    let props = node.interface(names::PROPERTIES).unwrap();
    assert_eq!(props.method("Get").unwrap().in_signature(), "ss");
    assert_eq!(props.method("Set").unwrap().in_signature(), "ssv");
    assert_eq!(props.method("GetAll").unwrap().out_signature(), "a{sv}");
    assert_eq!(
        props.signal(names::PROPERTIES_CHANGED).unwrap().signature(),
        "sa{sv}as"
    );

    let om = node.interface(names::OBJECT_MANAGER).unwrap();
    assert_eq!(
        om.method("GetManagedObjects").unwrap().out_signature(),
        "a{oa{sa{sv}}}"
    );
}
