//! Schema migrations
//!
//! Documents written by older firmware are brought up to [`SCHEMA_VERSION`]
//! before the tree is built. Every step runs on every load, in registration
//! order, and gates itself on the version the document was loaded with.
//! A step that fails is rolled back and logged; later steps still run.

use crate::document::{tag_for_xml, Document, Element};
use crate::error::MigrationError;
use crate::value::ValueType;
use tracing::{info, warn};

/// Version written into every saved document
pub const SCHEMA_VERSION: u32 = 9;

/// Version assumed for documents without a usable `version` attribute
pub const OLDEST_VERSION: u32 = 1;

/// Document transform; receives the `Settings` root and the loaded version
pub type StepFn = fn(&mut Element, u32) -> Result<(), MigrationError>;

/// A named migration step
#[derive(Clone, Copy)]
pub struct MigrationStep {
    pub name: &'static str,
    pub run: StepFn,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep").field("name", &self.name).finish()
    }
}

/// Outcome of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    /// Names of steps that failed and were rolled back
    pub failed: Vec<&'static str>,
    /// Whether the `version` attribute was rewritten
    pub version_changed: bool,
}

/// Ordered list of migration steps
#[derive(Debug, Clone)]
pub struct MigrationPipeline {
    steps: Vec<MigrationStep>,
    target: u32,
}

impl Default for MigrationPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl MigrationPipeline {
    /// Pipeline with no steps that stamps `target`
    pub fn new(target: u32) -> Self {
        Self {
            steps: Vec::new(),
            target,
        }
    }

    /// Every known step, targeting the current schema version
    pub fn standard() -> Self {
        let mut pipeline = Self::new(SCHEMA_VERSION);
        pipeline.register("remote_support_ssh", remote_support_ssh);
        pipeline.register("split_mqtt", split_mqtt);
        pipeline.register("drop_remote_support_port", drop_remote_support_port);
        pipeline.register("float_to_int_functions", float_to_int_functions);
        pipeline.register("fronius_device_instances", fronius_device_instances);
        pipeline.register("prefix_cgwacs_devices", prefix_cgwacs_devices);
        pipeline.register("cgwacs_device_instances", cgwacs_device_instances);
        pipeline
    }

    /// Append a step; steps run in registration order
    pub fn register(&mut self, name: &'static str, run: StepFn) -> &mut Self {
        self.steps.push(MigrationStep { name, run });
        self
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Run every step against `document` and stamp the target version
    pub fn migrate(&self, document: &mut Document) -> MigrationReport {
        let from_version = document.version();
        let mut failed = Vec::new();

        for step in &self.steps {
            let snapshot = document.root.clone();
            if let Err(e) = (step.run)(&mut document.root, from_version) {
                warn!("Migration step {} failed: {}", step.name, e);
                document.root = snapshot;
                failed.push(step.name);
            }
        }

        let target_text = self.target.to_string();
        let version_changed = document.version_text() != Some(target_text.as_str());
        if version_changed {
            info!(
                "Updating settings version from {} to {}",
                document.version_text().unwrap_or("none"),
                target_text
            );
            document.set_version(self.target);
        }

        MigrationReport {
            from_version,
            to_version: self.target,
            failed,
            version_changed,
        }
    }
}

// ========== Steps ==========

/// Remote support used to imply ssh access on the LAN
fn remote_support_ssh(root: &mut Element, version: u32) -> Result<(), MigrationError> {
    if version != 1 {
        return Ok(());
    }
    if root.find_text("System/RemoteSupport") == Some("1") {
        info!("Enabling ssh on LAN since it was enabled by remote support");
        root.set_leaf("System/SSHLocal", 1, ValueType::Integer);
    }
    Ok(())
}

/// One mqtt switch became separate local, insecure and VRM switches
fn split_mqtt(root: &mut Element, version: u32) -> Result<(), MigrationError> {
    if version > 2 {
        return Ok(());
    }
    let Some(services) = root.child_mut("Services") else {
        return Ok(());
    };
    let mqtt = services.child("Mqtt").map(Element::text);
    let pubnub = services.child("Vrmpubnub").map(Element::text);
    if mqtt.is_none() && pubnub.is_none() {
        return Ok(());
    }

    let local = i64::from(mqtt == Some("1"));
    let vrm = i64::from(local == 1 || pubnub == Some("1"));

    services.set_leaf("MqttLocal", local, ValueType::Integer);
    services.set_leaf("MqttLocalInsecure", local, ValueType::Integer);
    services.set_leaf("MqttVrm", vrm, ValueType::Integer);
    services.remove("Mqtt");
    services.remove("Vrmpubnub");
    Ok(())
}

/// The remote support port moved elsewhere and now also stores the address
fn drop_remote_support_port(root: &mut Element, version: u32) -> Result<(), MigrationError> {
    if version > 3 {
        return Ok(());
    }
    root.remove("System/RemoteSupportPort");
    Ok(())
}

/// Enumerations that were stored as floats become integers under a new name
fn float_to_int_functions(root: &mut Element, version: u32) -> Result<(), MigrationError> {
    if version > 5 {
        return Ok(());
    }
    const PATTERNS: [&str; 5] = [
        "AnalogInput/Resistive/*/Function",
        "AnalogInput/Temperature/*/Function",
        "Tank/*/FluidType",
        "Tank/*/Standard",
        "Temperature/*/TemperatureType",
    ];

    for pattern in PATTERNS {
        for path in root.expand(pattern) {
            if let Err(e) = retype_float_to_int(root, &path) {
                warn!("{}", e);
            }
        }
    }
    Ok(())
}

fn float_text_to_int(text: &str) -> Option<String> {
    let value: f64 = text.trim().parse().ok()?;
    value.is_finite().then(|| (value.trunc() as i64).to_string())
}

fn retype_float_to_int(root: &mut Element, path: &str) -> Result<(), MigrationError> {
    let malformed = |reason: &str| MigrationError::Malformed {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    let element = root
        .find_mut(path)
        .ok_or_else(|| MigrationError::MissingNode(path.to_string()))?;

    let text = float_text_to_int(element.text()).ok_or_else(|| malformed("value is not a number"))?;
    element.set_attr("type", ValueType::Integer.code());
    for attr in ["min", "max", "default"] {
        if let Some(converted) = element.attr(attr).and_then(float_text_to_int) {
            element.set_attr(attr, converted);
        }
    }
    element.text = Some(text);

    let new_tag = format!("{}2", element.tag);
    if !root.rename(path, &new_tag) {
        return Err(malformed("rename failed"));
    }
    Ok(())
}

/// Fronius inverters get a stable identity in the devices subtree
fn fronius_device_instances(root: &mut Element, version: u32) -> Result<(), MigrationError> {
    if version > 7 {
        return Ok(());
    }
    let Some(ids) = root.find_text("Fronius/InverterIds").map(str::to_string) else {
        return Ok(());
    };

    for (index, id) in ids.split(',').map(str::trim).filter(|s| !s.is_empty()).enumerate() {
        let path = format!("Devices/{}/ClassAndVrmInstance", tag_for_xml(id));
        root.set_leaf(&path, format!("pvinverter:{}", 20 + index), ValueType::String);
    }
    Ok(())
}

/// Energy meter device groups were briefly stored without their prefix
fn prefix_cgwacs_devices(root: &mut Element, version: u32) -> Result<(), MigrationError> {
    if version >= 8 {
        return Ok(());
    }
    let Some(ids) = root.find_text("CGwacs/DeviceIds").map(str::to_string) else {
        return Ok(());
    };

    for id in ids.split(',').map(str::trim) {
        // Digit-leading ids never made it into a valid document
        if id.is_empty() || id.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        if !root.rename(&format!("Devices/{}", id), &format!("cgwacs_{}", id)) {
            continue;
        }
        root.rename(&format!("Devices/{}_S", id), &format!("cgwacs_{}_S", id));
    }
    Ok(())
}

/// Energy meter settings moved from `CGwacs/Devices` to the devices subtree,
/// with the second (piggyback) inverter as its own `_S` device
fn cgwacs_device_instances(root: &mut Element, version: u32) -> Result<(), MigrationError> {
    if version >= 8 {
        return Ok(());
    }
    let Some(meters) = root.find("CGwacs/Devices") else {
        return Ok(());
    };

    let mut leaves = Vec::new();
    let mut migrated = Vec::new();
    for meter in &meters.children {
        match meter_leaves(meter) {
            Ok(found) => {
                leaves.extend(found);
                migrated.push(meter.tag.clone());
            }
            Err(e) => warn!("{}", e),
        }
    }

    for (path, value, value_type) in leaves {
        root.insert_leaf_if_absent(&path, value, value_type);
    }
    for tag in migrated {
        root.remove_and_prune(&format!("CGwacs/Devices/{}", tag));
    }
    Ok(())
}

fn meter_leaves(meter: &Element) -> Result<Vec<(String, String, ValueType)>, MigrationError> {
    // Old tags carry a one-letter prefix in front of the serial
    let serial = meter.tag.get(1..).unwrap_or_default();
    let device = format!("Devices/cgwacs_{}", serial);
    let piggyback = format!("{}_S", device);

    let required = |path: &str| {
        meter
            .find_text(path)
            .map(str::to_string)
            .ok_or_else(|| MigrationError::MissingNode(format!("CGwacs/Devices/{}/{}", meter.tag, path)))
    };
    let device_type: i64 = required("DeviceType")?.trim().parse().map_err(|_| MigrationError::Malformed {
        path: format!("CGwacs/Devices/{}/DeviceType", meter.tag),
        reason: "value is not an integer".to_string(),
    })?;
    let multiphase = (71..=73).contains(&device_type) || (340..=345).contains(&device_type);

    let mut leaves = vec![
        (
            format!("{}/ClassAndVrmInstance", device),
            format!("{}:{}", required("ServiceType")?, required("DeviceInstance")?),
            ValueType::String,
        ),
        (
            format!("{}/SupportMultiphase", device),
            i64::from(multiphase).to_string(),
            ValueType::Integer,
        ),
    ];
    for (name, value_type) in [
        ("CustomName", ValueType::String),
        ("L1ReverseEnergy", ValueType::Float),
        ("L2ReverseEnergy", ValueType::Float),
        ("L3ReverseEnergy", ValueType::Float),
        ("Position", ValueType::Integer),
    ] {
        if let Some(text) = meter.find_text(name) {
            leaves.push((format!("{}/{}", device, name), text.to_string(), value_type));
        }
    }
    leaves.push((
        format!("{}/IsMultiphase", device),
        required("IsMultiPhase")?,
        ValueType::Integer,
    ));

    leaves.push((
        format!("{}/ClassAndVrmInstance", piggyback),
        format!("pvinverter:{}", required("L2/DeviceInstance")?),
        ValueType::String,
    ));
    let enabled = meter.find_text("L2/ServiceType") == Some("pvinverter");
    leaves.push((
        format!("{}/Enabled", piggyback),
        i64::from(enabled).to_string(),
        ValueType::Integer,
    ));
    leaves.push((
        format!("{}/Position", piggyback),
        required("L2/Position")?,
        ValueType::Integer,
    ));
    if let Some(name) = meter.find_text("L2/CustomName") {
        leaves.push((format!("{}/CustomName", piggyback), name.to_string(), ValueType::String));
    }
    Ok(leaves)
}
