use plist::{Dictionary, Value};
use serde::Serialize;

use super::{BackupError, INFO_PLIST, MANIFEST_PLIST};

/// Device metadata from `Info.plist`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub device_name: String,
    pub display_name: Option<String>,
    pub product_type: Option<String>,
    pub product_version: Option<String>,
    pub serial_number: Option<String>,
    pub unique_identifier: Option<String>,
}

fn dictionary<'a>(value: &'a Value, file: &'static str) -> Result<&'a Dictionary, BackupError> {
    value.as_dictionary().ok_or_else(|| BackupError::Invalid {
        file,
        reason: "top level is not a dictionary".to_string(),
    })
}

fn optional_string(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_string).map(str::to_string)
}

impl BackupInfo {
    pub fn from_plist(value: &Value) -> Result<Self, BackupError> {
        let dict = dictionary(value, INFO_PLIST)?;
        let device_name = optional_string(dict, "Device Name")
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| BackupError::Invalid {
                file: INFO_PLIST,
                reason: "missing \"Device Name\"".to_string(),
            })?;
        Ok(Self {
            device_name,
            display_name: optional_string(dict, "Display Name"),
            product_type: optional_string(dict, "Product Type"),
            product_version: optional_string(dict, "Product Version"),
            serial_number: optional_string(dict, "Serial Number"),
            unique_identifier: optional_string(dict, "Unique Identifier"),
        })
    }

    /// Device name usable as a single path component
    pub fn directory_name(&self) -> String {
        let name: String = self
            .device_name
            .trim()
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '\0' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        match name.as_str() {
            "." | ".." => name.replace('.', "_"),
            _ => name,
        }
    }
}

/// Encryption state from `Manifest.plist`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupManifest {
    pub is_encrypted: bool,
    pub keybag: Option<Vec<u8>>,
    pub version: Option<String>,
}

impl BackupManifest {
    pub fn from_plist(value: &Value) -> Result<Self, BackupError> {
        let dict = dictionary(value, MANIFEST_PLIST)?;
        let is_encrypted = dict
            .get("IsEncrypted")
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        let keybag = dict
            .get("BackupKeyBag")
            .and_then(Value::as_data)
            .map(<[u8]>::to_vec);
        if is_encrypted && keybag.is_none() {
            return Err(BackupError::Invalid {
                file: MANIFEST_PLIST,
                reason: "encrypted backup without \"BackupKeyBag\"".to_string(),
            });
        }
        Ok(Self {
            is_encrypted,
            keybag,
            version: optional_string(dict, "Version"),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(name: &str) -> Value {
        let mut dict = Dictionary::new();
        dict.insert("Device Name".to_string(), Value::String(name.to_string()));
        dict.insert("Product Type".to_string(), Value::String("iPhone3,1".to_string()));
        Value::Dictionary(dict)
    }

    #[test]
    fn test_info_device_name() {
        let parsed = BackupInfo::from_plist(&info("Alice's Phone")).unwrap();
        assert_eq!(parsed.device_name, "Alice's Phone");
        assert_eq!(parsed.product_type.as_deref(), Some("iPhone3,1"));
        assert_eq!(parsed.serial_number, None);
    }

    #[test]
    fn test_info_requires_device_name() {
        let value = Value::Dictionary(Dictionary::new());
        assert!(matches!(
            BackupInfo::from_plist(&value),
            Err(BackupError::Invalid { file: INFO_PLIST, .. })
        ));
        assert!(BackupInfo::from_plist(&info("   ")).is_err());
    }

    #[test]
    fn test_directory_name_is_sanitized() {
        let named = BackupInfo::from_plist(&info("work/phone: 2")).unwrap();
        assert_eq!(named.directory_name(), "work_phone_ 2");
        let dots = BackupInfo::from_plist(&info("..")).unwrap();
        assert_eq!(dots.directory_name(), "__");
    }

    #[test]
    fn test_manifest_plist() {
        let mut dict = Dictionary::new();
        dict.insert("IsEncrypted".to_string(), Value::Boolean(true));
        dict.insert("BackupKeyBag".to_string(), Value::Data(vec![1, 2, 3]));
        let manifest = BackupManifest::from_plist(&Value::Dictionary(dict)).unwrap();
        assert!(manifest.is_encrypted);
        assert_eq!(manifest.keybag, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_encrypted_manifest_without_keybag() {
        let mut dict = Dictionary::new();
        dict.insert("IsEncrypted".to_string(), Value::Boolean(true));
        assert!(BackupManifest::from_plist(&Value::Dictionary(dict)).is_err());
    }
}
