use asa_core::buffer::ByteBuffer;
use asa_core::context::{Name, NameTable, SaveContext};
use asa_core::error::SaveError;
use asa_core::object::GameObject;
use asa_core::property::structs::Vector;
use asa_core::property::{
    ArrayElements, ArrayValue, EnumValue, MapValue, ObjectRef, Property, PropertyBag,
    PropertyDecoder, PropertyEncoder, PropertyType, SetValue, SoftObjectPath, StructBody,
    StructHeader, StructValue, Value, WellKnownKind, WellKnownStruct,
};
use asa_core::DecodeOptions;
use uuid::Uuid;

const VERSION: u16 = 13;

fn context() -> SaveContext {
    context_at(VERSION)
}

fn context_at(version: u16) -> SaveContext {
    let names = PropertyType::all_names()
        .chain(WellKnownKind::all_names())
        .chain([
            "None",
            "Dodo_Character_BP_C",
            "Health",
            "bIsFemale",
            "TamedName",
            "Stance",
            "EStance",
            "Prone",
            "Level",
            "Location",
            "MyStats",
            "StatusInfo",
            "CurrentStatusValues",
            "Owner",
            "Saddle",
            "PrimalItemArmor_DodoSaddle",
            "Tags",
            "Tamed",
            "ItemEntries",
            "ItemEntry",
            "Quantity",
            "ItemName",
            "ColorSets",
            "UnlockedRegions",
        ]);
    SaveContext::new(version, NameTable::from_names(names))
}

fn bag(properties: Vec<Property>) -> PropertyBag {
    PropertyBag::new(properties)
}

fn generic_struct(struct_type: &str, properties: Vec<Property>) -> StructValue {
    StructValue {
        struct_type: Name::new(struct_type),
        guid: [0; 16],
        body: StructBody::Bag(bag(properties)),
    }
}

fn fixed_struct(fixed: WellKnownStruct) -> StructValue {
    StructValue {
        struct_type: Name::new(fixed.kind().as_str()),
        guid: [0; 16],
        body: StructBody::Fixed(fixed),
    }
}

fn item(quantity: i32, name: &str) -> StructValue {
    generic_struct(
        "ItemEntry",
        vec![
            Property::new("Quantity", Value::Int(quantity)),
            Property::new("ItemName", Value::Str(name.to_string())),
        ],
    )
}

fn sample_object() -> GameObject {
    let mut object = GameObject::new(Uuid::from_u128(0xD0D0), "Dodo_Character_BP_C");
    let owner = Uuid::from_u128(0x0ABC);
    object.properties = bag(vec![
        Property::new("Health", Value::Float(112.5)),
        Property::new("bIsFemale", Value::Bool(true)),
        Property::new("TamedName", Value::Str("Pebbles".to_string())),
        Property::new(
            "Stance",
            Value::Enum(EnumValue {
                enum_type: Name::new("EStance"),
                value: Name::new("Prone"),
            }),
        ),
        Property::new("Level", Value::Byte(14)),
        Property::new(
            "Location",
            Value::Struct(fixed_struct(WellKnownStruct::Vector(Vector {
                x: 1.0,
                y: 2.0,
                z: 3.0,
            }))),
        ),
        Property::new(
            "MyStats",
            Value::Struct(generic_struct(
                "StatusInfo",
                vec![
                    Property::new("CurrentStatusValues", Value::Float(5.0)),
                    Property::new("CurrentStatusValues", Value::Float(7.0)).with_position(1),
                ],
            )),
        ),
        Property::new("Owner", Value::Object(ObjectRef::Id(owner))),
        Property::new(
            "Saddle",
            Value::SoftObject(SoftObjectPath {
                asset: Name::new("PrimalItemArmor_DodoSaddle"),
                sub_path: String::new(),
            }),
        ),
        Property::new(
            "Tags",
            Value::Array(ArrayValue {
                element_type: Name::new("NameProperty"),
                elements: ArrayElements::Scalars(vec![
                    Value::Name(Name::new("Tamed")),
                    Value::Name(Name::resolved("Tamed", 0, 3)),
                ]),
            }),
        ),
        Property::new(
            "ItemEntries",
            Value::Array(ArrayValue {
                element_type: Name::new("StructProperty"),
                elements: ArrayElements::Structs {
                    header: StructHeader::for_array("ItemEntries", "ItemEntry", VERSION),
                    items: vec![item(3, "Berry"), item(1, "Mejoberry")],
                },
            }),
        ),
        Property::new(
            "ColorSets",
            Value::Map(MapValue {
                key_type: Name::new("IntProperty"),
                value_type: Name::new("StructProperty"),
                header: StructHeader {
                    position: None,
                    ..StructHeader::for_array("ColorSets", "LinearColor", VERSION)
                },
                entries: vec![(
                    Value::Int(0),
                    fixed_struct(WellKnownStruct::LinearColor {
                        r: 1.0,
                        g: 0.5,
                        b: 0.25,
                        a: 1.0,
                    }),
                )],
            }),
        ),
        Property::new(
            "UnlockedRegions",
            Value::Set(SetValue {
                element_type: Name::new("IntProperty"),
                elements: vec![Value::Int(1), Value::Int(3)],
            }),
        ),
    ]);
    object
}

#[test]
fn object_round_trips_byte_for_byte() {
    let ctx = context();
    let object = sample_object();
    let bytes = object.to_bytes(&ctx).expect("encode sample object");

    let decoded = GameObject::decode(object.id, &bytes, &ctx, DecodeOptions::strict())
        .expect("decode sample object");
    assert_eq!(decoded.properties, object.properties);
    assert_eq!(decoded.to_bytes(&ctx).expect("re-encode"), bytes);
    assert_eq!(decoded.properties_end, bytes.len() - 8);
}

#[test]
fn decoded_values_are_reachable_through_accessors() {
    let ctx = context();
    let object = sample_object();
    let bytes = object.to_bytes(&ctx).expect("encode sample object");
    let decoded = GameObject::decode(object.id, &bytes, &ctx, DecodeOptions::default())
        .expect("decode sample object");
    let props = &decoded.properties;

    assert_eq!(props.get_f64("Health"), Some(112.5));
    assert_eq!(props.get_bool("bIsFemale"), Some(true));
    assert_eq!(props.get_str("TamedName"), Some("Pebbles"));
    assert_eq!(props.get_i64("Level"), Some(14));
    match props.get("Stance") {
        Some(Value::Enum(e)) => assert_eq!(e.to_string(), "EStance::Prone"),
        other => panic!("unexpected stance {other:?}"),
    }

    let location = props.get_struct("Location").and_then(StructValue::fixed);
    assert_eq!(
        location,
        Some(&WellKnownStruct::Vector(Vector {
            x: 1.0,
            y: 2.0,
            z: 3.0
        }))
    );

    let stats = props.get_struct("MyStats").and_then(StructValue::bag).expect("stats bag");
    assert_eq!(stats.find_all("CurrentStatusValues").len(), 2);
    assert_eq!(stats.get_at("CurrentStatusValues", 1), Some(&Value::Float(7.0)));

    let tags = props.get_array("Tags");
    assert_eq!(tags.len(), 2);
    assert_eq!(tags[1].as_str(), Some("Tamed"));
    assert!(matches!(&tags[1], Value::Name(n) if n.to_string() == "Tamed_2"));

    let items = props.get_array("ItemEntries");
    assert_eq!(items.len(), 2);
    let second = items[1].as_struct().and_then(StructValue::bag).expect("item bag");
    assert_eq!(second.get_str("ItemName"), Some("Mejoberry"));

    assert!(props.get("Missing").is_none());
    assert!(props.get_array("Missing").is_empty());
}

#[test]
fn spans_cover_exactly_their_bytes() {
    let ctx = context();
    let object = sample_object();
    let bytes = object.to_bytes(&ctx).expect("encode sample object");
    let decoded = GameObject::decode(object.id, &bytes, &ctx, DecodeOptions::strict())
        .expect("decode sample object");

    let mut cursor = decoded.properties_start;
    for property in &decoded.properties {
        let span = property.span;
        assert_eq!(span.range.start, cursor, "{} starts where the last ended", property.name);
        let declared = u32::from_le_bytes(
            bytes[span.size_field..span.size_field + 4]
                .try_into()
                .expect("size field"),
        ) as usize;
        assert_eq!(declared, span.payload.len(), "{} declared size", property.name);
        assert_eq!(span.payload.end, span.range.end);
        cursor = span.range.end;
    }
    assert_eq!(cursor, decoded.properties_end);

    let name = decoded.properties.property("TamedName").expect("tamed name");
    assert_eq!(name.span.payload.len(), 4 + "Pebbles".len() + 1);
}

fn struct_with_padding(ctx: &SaveContext) -> (Vec<u8>, GameObject) {
    let object = sample_object();
    let mut bytes = object.to_bytes(ctx).expect("encode sample object");
    let decoded = GameObject::decode(object.id, &bytes, ctx, DecodeOptions::strict())
        .expect("decode sample object");

    // Four unread bytes at the end of MyStats, counted by its size field.
    let stats = decoded.properties.property("MyStats").expect("stats").span;
    bytes.splice(stats.payload.end..stats.payload.end, [0xEE; 4]);
    let size = (stats.payload.len() + 4) as u32;
    bytes[stats.size_field..stats.size_field + 4].copy_from_slice(&size.to_le_bytes());
    (bytes, object)
}

#[test]
fn struct_size_mismatch_resyncs_to_declared_end() {
    let ctx = context();
    let (bytes, object) = struct_with_padding(&ctx);

    let decoded = GameObject::decode(object.id, &bytes, &ctx, DecodeOptions::default())
        .expect("mismatch is recovered");
    let stats = decoded.properties.property("MyStats").expect("stats");
    let expected = object.properties.property("MyStats").expect("stats");
    assert_eq!(stats.value, expected.value);
    assert_eq!(stats.trailing, vec![0xEE; 4]);
    assert_eq!(stats.span.payload.len(), bytes_declared(&bytes, stats.span.size_field));
    assert_eq!(decoded.properties.get_str("TamedName"), Some("Pebbles"));
}

#[test]
fn resynced_struct_keeps_skipped_bytes_on_re_encode() {
    let ctx = context();
    let (bytes, object) = struct_with_padding(&ctx);

    let decoded = GameObject::decode(object.id, &bytes, &ctx, DecodeOptions::default())
        .expect("mismatch is recovered");
    let encoded = decoded.to_bytes(&ctx).expect("re-encode");
    assert_eq!(encoded.len(), bytes.len());
    assert_eq!(encoded, bytes);

    let stats = decoded.properties.property("MyStats").expect("stats");
    assert_eq!(
        bytes_declared(&encoded, stats.span.size_field),
        bytes_declared(&bytes, stats.span.size_field)
    );
}

fn bytes_declared(bytes: &[u8], field: usize) -> usize {
    u32::from_le_bytes(bytes[field..field + 4].try_into().expect("size field")) as usize
}

#[test]
fn strict_mode_reports_struct_size_mismatch() {
    let ctx = context();
    let (bytes, object) = struct_with_padding(&ctx);

    let err = GameObject::decode(object.id, &bytes, &ctx, DecodeOptions::strict())
        .expect_err("strict decode must fail");
    assert!(err.is_recoverable());
    match err {
        SaveError::StructSizeMismatch {
            struct_type,
            expected_end,
            actual_end,
        } => {
            assert_eq!(struct_type, "StatusInfo");
            assert_eq!(expected_end, actual_end + 4);
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn maps_require_struct_values() {
    let ctx = context();
    let mut object = GameObject::new(Uuid::from_u128(1), "Dodo_Character_BP_C");
    object.properties.push(Property::new(
        "ColorSets",
        Value::Map(MapValue {
            key_type: Name::new("IntProperty"),
            value_type: Name::new("IntProperty"),
            header: StructHeader::for_array("ColorSets", "LinearColor", VERSION),
            entries: Vec::new(),
        }),
    ));
    let bytes = object.to_bytes(&ctx).expect("encode");

    let err = GameObject::decode(object.id, &bytes, &ctx, DecodeOptions::default())
        .expect_err("int-valued map is unsupported");
    assert!(matches!(
        err,
        SaveError::UnsupportedValueType { ref property, ref value_type }
            if property == "ColorSets" && value_type == "IntProperty"
    ));
}

#[test]
fn unknown_name_index_is_fatal() {
    let ctx = context();
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&9_999u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());

    let err = GameObject::decode(Uuid::nil(), &bytes, &ctx, DecodeOptions::permissive())
        .expect_err("unresolved blueprint");
    assert!(matches!(err, SaveError::UnresolvedName { index: 9_999, offset: 0 }));
    assert!(!err.is_recoverable());
}

#[test]
fn truncated_blob_underflows() {
    let ctx = context();
    let bytes = sample_object().to_bytes(&ctx).expect("encode");
    let err = GameObject::decode(Uuid::nil(), &bytes[..bytes.len() - 12], &ctx, DecodeOptions::default())
        .expect_err("truncated");
    assert!(matches!(err, SaveError::BufferUnderflow { .. }));
}

#[test]
fn name_table_resolves_both_ways() {
    let ctx = context();
    let names = ctx.names();
    assert!(!names.is_empty());
    for (index, name) in names.iter() {
        assert_eq!(names.resolve(index), Some(name));
        assert_eq!(names.index_of(name), Some(index));
    }
}

#[test]
fn object_serializes_to_json() {
    let ctx = context();
    let object = sample_object();
    let bytes = object.to_bytes(&ctx).expect("encode");
    let decoded =
        GameObject::decode(object.id, &bytes, &ctx, DecodeOptions::default()).expect("decode");

    let json = serde_json::to_value(&decoded).expect("serialize");
    assert_eq!(json["blueprint"], "Dodo_Character_BP_C");
    let properties = json["properties"].as_array().expect("properties array");
    assert_eq!(properties.len(), decoded.properties.len());
    assert_eq!(properties[2]["name"], "TamedName");
    assert_eq!(properties[2]["value"], "Pebbles");
}

fn struct_array(header: StructHeader) -> Property {
    Property::new(
        "ItemEntries",
        Value::Array(ArrayValue {
            element_type: Name::new("StructProperty"),
            elements: ArrayElements::Structs {
                header,
                items: vec![item(3, "Berry")],
            },
        }),
    )
}

/// Encode one property, decode it back and check the bytes are reproduced.
/// Returns the encoded length and the decoded property.
fn round_trip_property(ctx: &SaveContext, property: &Property) -> (usize, Property) {
    let bytes = PropertyEncoder::new(ctx).encode_property(property).expect("encode");
    let mut buf = ByteBuffer::new(bytes.clone());
    let decoded = PropertyDecoder::new(ctx, DecodeOptions::strict())
        .read_property(&mut buf, false)
        .expect("decode")
        .expect("property, not terminator");
    assert_eq!(buf.remaining(), 0);
    assert_eq!(&decoded, property);
    assert_eq!(
        PropertyEncoder::new(ctx).encode_property(&decoded).expect("re-encode"),
        bytes
    );
    (bytes.len(), decoded)
}

fn decoded_header(property: &Property) -> StructHeader {
    match &property.value {
        Value::Array(ArrayValue {
            elements: ArrayElements::Structs { header, .. },
            ..
        }) => header.clone(),
        Value::Map(map) => map.header.clone(),
        other => panic!("no struct header in {other:?}"),
    }
}

// Tag (24) + element type (8) + flag (1) + count (4) + header without the
// size byte (44) + one ItemEntry bag (29 + 35 + 8).
const STRUCT_ARRAY_BASE: usize = 24 + 8 + 1 + 4 + 44 + 72;

#[test]
fn array_header_size_byte_eight_has_no_position() {
    let ctx = context();
    let property = struct_array(StructHeader {
        size_byte: Some(8),
        position: None,
        ..StructHeader::for_array("ItemEntries", "ItemEntry", VERSION)
    });
    let (len, decoded) = round_trip_property(&ctx, &property);
    assert_eq!(len, STRUCT_ARRAY_BASE + 1);
    let header = decoded_header(&decoded);
    assert_eq!(header.size_byte, Some(8));
    assert_eq!(header.position, None);
}

#[test]
fn array_header_size_byte_one_carries_a_position() {
    let ctx = context();
    let property = struct_array(StructHeader {
        size_byte: Some(1),
        position: Some(5),
        ..StructHeader::for_array("ItemEntries", "ItemEntry", VERSION)
    });
    let (len, decoded) = round_trip_property(&ctx, &property);
    assert_eq!(len, STRUCT_ARRAY_BASE + 1 + 4);
    assert_eq!(decoded_header(&decoded).position, Some(5));
}

#[test]
fn array_header_size_byte_zero_carries_a_position() {
    let ctx = context();
    let property = struct_array(StructHeader::for_array("ItemEntries", "ItemEntry", VERSION));
    let (len, decoded) = round_trip_property(&ctx, &property);
    assert_eq!(len, STRUCT_ARRAY_BASE + 1 + 4);
    let header = decoded_header(&decoded);
    assert_eq!(header.size_byte, Some(0));
    assert_eq!(header.position, Some(0));
    assert_eq!(header.inner_size as usize, 72);
}

#[test]
fn map_header_size_byte_zero_has_no_position() {
    let ctx = context();
    let property = Property::new(
        "ColorSets",
        Value::Map(MapValue {
            key_type: Name::new("IntProperty"),
            value_type: Name::new("StructProperty"),
            header: StructHeader {
                position: None,
                ..StructHeader::for_array("ColorSets", "ItemEntry", VERSION)
            },
            entries: vec![(Value::Int(7), item(3, "Berry"))],
        }),
    );
    let (len, decoded) = round_trip_property(&ctx, &property);
    // Tag (24) + key and value types (16) + flag (1) + count (4) + header
    // with its size byte (45) + key (4) + ItemEntry bag (72).
    assert_eq!(len, 24 + 16 + 1 + 4 + 45 + 4 + 72);
    let header = decoded_header(&decoded);
    assert_eq!(header.size_byte, Some(0));
    assert_eq!(header.position, None);
}

#[test]
fn headers_before_version_twelve_have_no_size_byte() {
    let ctx = context_at(11);
    let property = struct_array(StructHeader::for_array("ItemEntries", "ItemEntry", 11));
    let (len, decoded) = round_trip_property(&ctx, &property);
    assert_eq!(len, STRUCT_ARRAY_BASE);
    let header = decoded_header(&decoded);
    assert_eq!(header.size_byte, None);
    assert_eq!(header.position, None);
}

#[test]
fn position_rule_depends_on_size_byte_and_array_context() {
    assert!(StructHeader::has_position(0, true));
    assert!(!StructHeader::has_position(0, false));
    assert!(!StructHeader::has_position(8, true));
    assert!(!StructHeader::has_position(8, false));
    assert!(StructHeader::has_position(1, false));
    assert!(StructHeader::has_position(1, true));
}
