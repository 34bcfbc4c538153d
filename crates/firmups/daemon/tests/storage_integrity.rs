//! Referential integrity across the registry, parameters and device rows

mod common;

use common::Fleet;
use firmups_daemon::storage::{DeviceStorage, DeviceTypeStorage, FirmwareStorage, ParameterStorage};
use firmups_params::{ParameterError, TypedValue};
use firmups_registry::CompatibilityRegistry;
use firmups_rollout::DeviceStore;
use firmups_types::{
    Device, DeviceParameter, DeviceStatus, DeviceType, Firmware, ParameterSchema, ParameterType,
    StorageError,
};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn every_device_stays_compatible_through_a_rollout() {
    let fleet = Fleet::new().await;
    let t2 = DeviceType::new("T2").unwrap();
    let g1 = Firmware::from_image("gw", "4.0.0", b"G1").unwrap();
    assert_ok!(fleet.storage.create_device_type(t2.clone()).await);
    assert_ok!(fleet.storage.create_firmware(g1.clone()).await);
    assert_ok!(fleet.storage.register_compatibility(&t2.id, &g1.id).await);

    fleet
        .add_device("a", Some(&fleet.f1), &fleet.f2, DeviceStatus::Active)
        .await;
    fleet
        .add_device("b", None, &fleet.f1, DeviceStatus::Maintenance)
        .await;
    let gateway = Device::new("gw-1", t2.id, g1.id).unwrap();
    assert_ok!(fleet.storage.create_device(gateway).await);

    // T2 firmware on a T1 device is refused
    let mismatched = Device::new("c", fleet.t1.id, g1.id).unwrap();
    assert!(matches!(
        fleet.storage.create_device(mismatched).await,
        Err(StorageError::Conflict(_))
    ));

    fleet.controller.run_pass().await;

    let registry = fleet.storage.registry();
    for device in assert_ok!(fleet.storage.list_devices().await) {
        assert!(assert_ok!(
            registry
                .is_compatible(&device.device_type, &device.desired_firmware)
                .await
        ));
        if let Some(current) = device.current_firmware {
            assert!(assert_ok!(
                registry.is_compatible(&device.device_type, &current).await
            ));
        }
    }
}

#[tokio::test]
async fn retargeting_releases_the_previous_edge() {
    let fleet = Fleet::new().await;
    let device = fleet
        .add_device("d", Some(&fleet.f2), &fleet.f2, DeviceStatus::Active)
        .await;

    let err = assert_err!(
        fleet
            .storage
            .unregister_compatibility(&fleet.t1.id, &fleet.f2.id)
            .await
    );
    assert!(matches!(err, StorageError::Integrity(_)));

    // current still references F2 until the device moves off it
    assert_ok!(fleet.storage.set_desired_firmware(&device.id, &fleet.f1.id).await);
    assert_err!(
        fleet
            .storage
            .unregister_compatibility(&fleet.t1.id, &fleet.f2.id)
            .await
    );

    fleet.controller.run_pass().await;
    assert_eq!(fleet.device(&device.id).await.current_firmware, Some(fleet.f1.id));
    assert_ok!(
        fleet
            .storage
            .unregister_compatibility(&fleet.t1.id, &fleet.f2.id)
            .await
    );
    assert_ok!(fleet.storage.delete_firmware(&fleet.f2.id).await);
}

#[tokio::test]
async fn device_type_and_firmware_deletes_follow_references() {
    let fleet = Fleet::new().await;
    let device = fleet
        .add_device("d", None, &fleet.f1, DeviceStatus::Active)
        .await;

    assert!(matches!(
        fleet.storage.delete_device_type(&fleet.t1.id).await,
        Err(StorageError::Integrity(_))
    ));
    assert!(matches!(
        fleet.storage.delete_firmware(&fleet.f1.id).await,
        Err(StorageError::Integrity(_))
    ));
    // F3 has no edges and no devices
    assert!(assert_ok!(fleet.storage.delete_firmware(&fleet.f3.id).await));

    assert!(assert_ok!(fleet.storage.delete_device(&device.id).await));
    assert!(assert_ok!(fleet.storage.delete_device_type(&fleet.t1.id).await));
    assert!(assert_ok!(
        fleet.storage.registry().device_types_for(&fleet.f1.id).await
    )
    .is_empty());
    assert!(assert_ok!(fleet.storage.delete_firmware(&fleet.f1.id).await));
}

#[tokio::test]
async fn parameters_resolve_explicit_then_default_then_missing() {
    let fleet = Fleet::new().await;
    let t1 = fleet.t1.id;
    let sixty = 60i64.to_be_bytes().to_vec();
    for schema in [
        ParameterSchema::new(t1, "interval", ParameterType::Integer, Some(sixty)),
        ParameterSchema::new(t1, "label", ParameterType::String, None),
        ParameterSchema::new(t1, "psk", ParameterType::Binary, None),
    ] {
        assert_ok!(fleet.storage.declare_parameter(schema.unwrap()).await);
    }
    let device = fleet
        .add_device("d", None, &fleet.f1, DeviceStatus::Active)
        .await;

    assert_ok!(
        fleet
            .storage
            .set_parameter(DeviceParameter {
                device: device.id,
                key: "label".into(),
                value_type: ParameterType::String,
                value: Some(b"roof".to_vec()),
            })
            .await
    );
    let wrong_type = DeviceParameter {
        device: device.id,
        key: "interval".into(),
        value_type: ParameterType::String,
        value: Some(b"sixty".to_vec()),
    };
    assert!(matches!(
        fleet.storage.set_parameter(wrong_type).await,
        Err(StorageError::Schema(_))
    ));

    let rows = assert_ok!(fleet.storage.get_parameters(&device.id).await);
    let validator = fleet.storage.validator();

    assert_eq!(
        assert_ok!(validator.resolve(&t1, &rows, "label")),
        TypedValue::String("roof".into())
    );
    assert_eq!(
        assert_ok!(validator.resolve(&t1, &rows, "interval")),
        TypedValue::Integer(60)
    );
    assert!(matches!(
        validator.resolve(&t1, &rows, "psk"),
        Err(ParameterError::MissingValue { .. })
    ));
    assert!(matches!(
        validator.resolve(&t1, &rows, "colour"),
        Err(ParameterError::UnknownParameter { .. })
    ));

    // Dropping the explicit value falls back to nothing for a key without default
    assert!(assert_ok!(fleet.storage.delete_parameter(&device.id, "label").await));
    let rows = assert_ok!(fleet.storage.get_parameters(&device.id).await);
    assert_eq!(assert_ok!(validator.resolve_optional(&t1, &rows, "label")), None);
}
