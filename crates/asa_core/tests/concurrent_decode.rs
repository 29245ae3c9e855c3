use std::sync::Arc;
use std::thread;

use asa_core::context::{NameTable, SaveContext};
use asa_core::object::GameObject;
use asa_core::property::{Property, PropertyType, Value};
use asa_core::DecodeOptions;
use uuid::Uuid;

#[test]
fn objects_decode_in_parallel_against_one_context() {
    let names = PropertyType::all_names().chain(["None", "Dodo_Character_BP_C", "Health", "TamedName"]);
    let ctx = Arc::new(SaveContext::new(13, NameTable::from_names(names)));

    let blobs: Vec<(Uuid, Vec<u8>)> = (0..64u32)
        .map(|i| {
            let mut object = GameObject::new(Uuid::from_u128(u128::from(i) + 1), "Dodo_Character_BP_C");
            object.properties.push(Property::new("Health", Value::Float(i as f32)));
            object
                .properties
                .push(Property::new("TamedName", Value::Str(format!("Dodo {i}"))));
            (object.id, object.to_bytes(&ctx).expect("encode"))
        })
        .collect();

    let decoded: Vec<GameObject> = thread::scope(|scope| {
        let workers: Vec<_> = blobs
            .chunks(16)
            .map(|chunk| {
                let ctx = Arc::clone(&ctx);
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|(id, bytes)| {
                            GameObject::decode(*id, bytes, &ctx, DecodeOptions::strict())
                                .expect("decode")
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().expect("worker panicked"))
            .collect()
    });

    assert_eq!(decoded.len(), 64);
    for (i, object) in decoded.iter().enumerate() {
        assert_eq!(object.id, Uuid::from_u128(i as u128 + 1));
        assert_eq!(object.properties.get_f64("Health"), Some(i as f64));
        assert_eq!(object.properties.get_str("TamedName"), Some(format!("Dodo {i}").as_str()));
    }
}
