//! Selection of the BLE characteristic a payload is written to.

use btleplug::api::CharPropFlags;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::ble::CharacteristicInfo;

/// Picks the write endpoint among a session's discovered characteristics.
///
/// Without an explicit target, the writable characteristic with the
/// smallest UUID wins, so the choice does not depend on discovery order.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteEndpointResolver;

impl WriteEndpointResolver {
    /// Check whether a characteristic accepts writes.
    pub fn is_writable(properties: CharPropFlags) -> bool {
        properties.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
    }

    /// Resolve the endpoint for a write.
    pub fn resolve(
        characteristics: &[CharacteristicInfo],
        target: Option<Uuid>,
    ) -> Result<CharacteristicInfo> {
        if let Some(uuid) = target {
            return characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| Error::CharacteristicNotFound {
                    uuid: uuid.to_string(),
                });
        }

        characteristics
            .iter()
            .filter(|c| Self::is_writable(c.properties))
            .min_by_key(|c| (c.uuid, c.service_uuid))
            .cloned()
            .ok_or(Error::NoWritableEndpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn characteristic(uuid: u128, properties: CharPropFlags) -> CharacteristicInfo {
        CharacteristicInfo {
            uuid: Uuid::from_u128(uuid),
            service_uuid: Uuid::from_u128(0x18f0),
            properties,
        }
    }

    #[test]
    fn test_smallest_writable_uuid_wins() {
        let chars = vec![
            characteristic(0x2af1, CharPropFlags::WRITE),
            characteristic(0x2aa0, CharPropFlags::READ | CharPropFlags::NOTIFY),
            characteristic(0x2ae0, CharPropFlags::WRITE_WITHOUT_RESPONSE),
        ];

        let chosen = WriteEndpointResolver::resolve(&chars, None).unwrap();
        assert_eq!(chosen.uuid, Uuid::from_u128(0x2ae0));

        let mut reversed = chars.clone();
        reversed.reverse();
        let chosen = WriteEndpointResolver::resolve(&reversed, None).unwrap();
        assert_eq!(chosen.uuid, Uuid::from_u128(0x2ae0));
    }

    #[test]
    fn test_no_writable_endpoint() {
        let chars = vec![characteristic(0x2a00, CharPropFlags::READ)];
        assert!(matches!(
            WriteEndpointResolver::resolve(&chars, None),
            Err(Error::NoWritableEndpoint)
        ));
        assert!(matches!(
            WriteEndpointResolver::resolve(&[], None),
            Err(Error::NoWritableEndpoint)
        ));
    }

    #[test]
    fn test_explicit_target() {
        let chars = vec![
            characteristic(0x2a00, CharPropFlags::WRITE),
            characteristic(0x2b00, CharPropFlags::WRITE),
        ];

        let chosen =
            WriteEndpointResolver::resolve(&chars, Some(Uuid::from_u128(0x2b00))).unwrap();
        assert_eq!(chosen.uuid, Uuid::from_u128(0x2b00));

        assert!(matches!(
            WriteEndpointResolver::resolve(&chars, Some(Uuid::from_u128(0x9999))),
            Err(Error::CharacteristicNotFound { .. })
        ));
    }

    #[test]
    fn test_is_writable() {
        assert!(WriteEndpointResolver::is_writable(CharPropFlags::WRITE));
        assert!(WriteEndpointResolver::is_writable(
            CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::NOTIFY
        ));
        assert!(!WriteEndpointResolver::is_writable(CharPropFlags::READ));
    }
}
