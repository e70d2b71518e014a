use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::transaction::{abort, TransactionError, Transactional};
use sled::{Db, Tree};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Device already registered: {0}")]
    DuplicateDevice(String),
    #[error("Corrupt key in {0}")]
    CorruptKey(&'static str),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A reading as posted by a sensor, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReading {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub soil_moisture: f64,
    pub battery_level: f64,
}

/// A stored, timestamped sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: u64,
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub soil_moisture: f64,
    pub battery_level: f64,
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    fn from_new(id: u64, reading: NewReading, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            device_id: reading.device_id,
            temperature: reading.temperature,
            humidity: reading.humidity,
            soil_moisture: reading.soil_moisture,
            battery_level: reading.battery_level,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
}

/// A registered sensor device. `device_id` and `mac_address` are unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub mac_address: String,
    pub firmware_version: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
}

impl Device {
    fn registered(device_id: &str, mac_address: &str, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            mac_address: mac_address.to_string(),
            firmware_version: None,
            last_seen: None,
            status: DeviceStatus::Online,
            created_at: now,
        }
    }
}

/// Persistence for sensor readings and device registrations.
pub trait SensorStore: Send + Sync {
    /// Append a reading stamped with `timestamp`.
    fn append_reading_at(&self, reading: NewReading, timestamp: DateTime<Utc>)
        -> Result<SensorReading>;

    /// Append a reading stamped with the current time.
    fn append_reading(&self, reading: NewReading) -> Result<SensorReading> {
        self.append_reading_at(reading, Utc::now())
    }

    /// Latest reading of `device_id`, or of any device when `None`.
    fn latest_reading(&self, device_id: Option<&str>) -> Result<Option<SensorReading>>;

    /// Readings of `device_id` taken at or after `since`, newest first.
    fn reading_history(&self, device_id: &str, since: DateTime<Utc>)
        -> Result<Vec<SensorReading>>;

    /// Register a device; fails with `DuplicateDevice` if the id or MAC is taken.
    fn register_device(&self, device_id: &str, mac_address: &str) -> Result<Device>;

    fn get_device(&self, device_id: &str) -> Result<Option<Device>>;

    fn list_devices(&self) -> Result<Vec<Device>>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Sled-backed implementation
pub struct SledSensorStore {
    db: Db,
    readings: Tree,
    readings_by_device: Tree,
    devices: Tree,
    device_macs: Tree,
}

impl SledSensorStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throwaway store that lives only as long as the process.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let readings = db.open_tree("sensor_readings")?;
        let readings_by_device = db.open_tree("readings_by_device")?;
        let devices = db.open_tree("devices")?;
        let device_macs = db.open_tree("device_macs")?;

        tracing::debug!(
            "Opened sensor store ({} readings, {} devices)",
            readings.len(),
            devices.len()
        );

        Ok(Self {
            db,
            readings,
            readings_by_device,
            devices,
            device_macs,
        })
    }

    fn device_prefix(device_id: &str) -> Vec<u8> {
        let mut prefix = device_id.as_bytes().to_vec();
        prefix.push(0);
        prefix
    }

    fn id_from_index_key(key: &[u8]) -> Result<u64> {
        let suffix = key
            .len()
            .checked_sub(8)
            .map(|start| &key[start..])
            .ok_or(StorageError::CorruptKey("readings_by_device"))?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(suffix);
        Ok(u64::from_be_bytes(bytes))
    }

    fn get_reading(&self, id: u64) -> Result<Option<SensorReading>> {
        self.readings
            .get(id.to_be_bytes())?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn touch_device(&self, device_id: &str, seen: DateTime<Utc>) -> Result<()> {
        if let Some(mut device) = self.get_device(device_id)? {
            device.last_seen = Some(seen);
            device.status = DeviceStatus::Online;
            self.devices
                .insert(device_id.as_bytes(), serde_json::to_vec(&device)?)?;
        }
        Ok(())
    }
}

impl SensorStore for SledSensorStore {
    fn append_reading_at(
        &self,
        reading: NewReading,
        timestamp: DateTime<Utc>,
    ) -> Result<SensorReading> {
        let id = self.db.generate_id()?;
        let stored = SensorReading::from_new(id, reading, timestamp);

        self.readings
            .insert(id.to_be_bytes(), serde_json::to_vec(&stored)?)?;
        let mut index_key = Self::device_prefix(&stored.device_id);
        index_key.extend_from_slice(&id.to_be_bytes());
        self.readings_by_device.insert(index_key, Vec::<u8>::new())?;

        self.touch_device(&stored.device_id, timestamp)?;
        Ok(stored)
    }

    fn latest_reading(&self, device_id: Option<&str>) -> Result<Option<SensorReading>> {
        let id = match device_id {
            None => match self.readings.last()? {
                Some((_, v)) => return Ok(Some(serde_json::from_slice(&v)?)),
                None => return Ok(None),
            },
            Some(device_id) => match self
                .readings_by_device
                .scan_prefix(Self::device_prefix(device_id))
                .next_back()
                .transpose()?
            {
                Some((key, _)) => Self::id_from_index_key(&key)?,
                None => return Ok(None),
            },
        };
        self.get_reading(id)
    }

    fn reading_history(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>> {
        let mut history = Vec::new();
        for entry in self
            .readings_by_device
            .scan_prefix(Self::device_prefix(device_id))
            .rev()
        {
            let (key, _) = entry?;
            if let Some(reading) = self.get_reading(Self::id_from_index_key(&key)?)? {
                if reading.timestamp >= since {
                    history.push(reading);
                }
            }
        }
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(history)
    }

    fn register_device(&self, device_id: &str, mac_address: &str) -> Result<Device> {
        let device = Device::registered(device_id, mac_address, Utc::now());
        let data = serde_json::to_vec(&device)?;

        let outcome = (&self.devices, &self.device_macs).transaction(|(devices, macs)| {
            if devices.get(device_id.as_bytes())?.is_some() {
                return abort(StorageError::DuplicateDevice(device_id.to_string()));
            }
            if macs.get(mac_address.as_bytes())?.is_some() {
                return abort(StorageError::DuplicateDevice(mac_address.to_string()));
            }
            devices.insert(device_id.as_bytes(), data.as_slice())?;
            macs.insert(mac_address.as_bytes(), device_id.as_bytes())?;
            Ok(())
        });

        match outcome {
            Ok(()) => {
                tracing::debug!("Registered device {} ({})", device_id, mac_address);
                Ok(device)
            }
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        self.devices
            .get(device_id.as_bytes())?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn list_devices(&self) -> Result<Vec<Device>> {
        self.devices
            .iter()
            .map(|r| {
                let (_, v) = r?;
                Ok(serde_json::from_slice::<Device>(&v)?)
            })
            .collect()
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory testing backend
#[derive(Default)]
pub struct MemorySensorStore {
    readings: Arc<RwLock<Vec<SensorReading>>>,
    devices: Arc<RwLock<BTreeMap<String, Device>>>,
}

impl SensorStore for MemorySensorStore {
    fn append_reading_at(
        &self,
        reading: NewReading,
        timestamp: DateTime<Utc>,
    ) -> Result<SensorReading> {
        let stored = {
            let mut readings = self.readings.write();
            let stored = SensorReading::from_new(readings.len() as u64, reading, timestamp);
            readings.push(stored.clone());
            stored
        };
        if let Some(device) = self.devices.write().get_mut(&stored.device_id) {
            device.last_seen = Some(timestamp);
            device.status = DeviceStatus::Online;
        }
        Ok(stored)
    }

    fn latest_reading(&self, device_id: Option<&str>) -> Result<Option<SensorReading>> {
        Ok(self
            .readings
            .read()
            .iter()
            .rev()
            .find(|r| device_id.map_or(true, |id| r.device_id == id))
            .cloned())
    }

    fn reading_history(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>> {
        let mut history: Vec<SensorReading> = self
            .readings
            .read()
            .iter()
            .filter(|r| r.device_id == device_id && r.timestamp >= since)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(history)
    }

    fn register_device(&self, device_id: &str, mac_address: &str) -> Result<Device> {
        let mut devices = self.devices.write();
        if devices.contains_key(device_id) {
            return Err(StorageError::DuplicateDevice(device_id.to_string()));
        }
        if devices.values().any(|d| d.mac_address == mac_address) {
            return Err(StorageError::DuplicateDevice(mac_address.to_string()));
        }
        let device = Device::registered(device_id, mac_address, Utc::now());
        devices.insert(device_id.to_string(), device.clone());
        Ok(device)
    }

    fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.devices.read().get(device_id).cloned())
    }

    fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_key_round_trip() {
        let mut key = SledSensorStore::device_prefix("esp-01");
        key.extend_from_slice(&42u64.to_be_bytes());
        assert_eq!(SledSensorStore::id_from_index_key(&key).unwrap(), 42);
        assert!(SledSensorStore::id_from_index_key(b"short").is_err());
    }

    #[test]
    fn test_device_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&DeviceStatus::Online).unwrap(),
            "\"online\""
        );
        assert_eq!(DeviceStatus::default(), DeviceStatus::Offline);
    }
}
