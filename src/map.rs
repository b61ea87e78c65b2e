//! The Alfen Eve register map as typed field tables.
//!
//! All addresses are client-visible register numbers; the simulator's block
//! offset is a dispatcher-internal detail that never appears here. A
//! [`FieldGroup`] is the unit of one read request: a contiguous span decoded
//! field by field.

use crate::codec::{Address, DataType, Quantity};

/// A named, typed view over a contiguous span of registers.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub key: &'static str,
    pub addr: Address,
    pub ty: DataType,
}

/// A declared register span read in one request.
#[derive(Debug, Clone, Copy)]
pub struct FieldGroup {
    pub name: &'static str,
    pub start: Address,
    pub count: Quantity,
    pub fields: &'static [Field],
}

/// Static numeric bounds of a writable field.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub min: f32,
    pub max: f32,
}

/// Commanded max current, the single writable socket field.
pub const SLAVE_MAX_CURRENT_ADDR: Address = 1210;
/// Read-only mirror of the commanded max current, written by the station.
pub const ACTUAL_APPLIED_MAX_CURRENT_ADDR: Address = 1206;
/// Bounds of the commanded max current slider.
pub const SLAVE_MAX_CURRENT_BOUNDS: Bounds = Bounds {
    min: 0.0,
    max: 32.0,
};

/// Station-wide hard ceiling, first tier of the write clamp.
pub const KEY_ACTUAL_MAX_CURRENT: &str = "actualMaxCurrent";
/// Per-socket safe current, second tier of the write clamp.
pub const KEY_SAFE_CURRENT: &str = "activeLoadBalancingSafeCurrent";

/// Snapshot key of a socket field: `socket_{id}_{key}`.
pub fn socket_key(socket: u8, key: &str) -> String {
    format!("socket_{socket}_{key}")
}

pub const STATION_GROUPS: &[FieldGroup] = &[PRODUCT_IDENTIFICATION, STATION_STATUS];
pub const SOCKET_GROUPS: &[FieldGroup] = &[SOCKET_METER, SOCKET_STATUS];

const PRODUCT_IDENTIFICATION: FieldGroup = FieldGroup {
    name: "product identification",
    start: 100,
    count: 79,
    fields: &[
        Field { key: "name", addr: 100, ty: DataType::Str(34) },
        Field { key: "manufacturer", addr: 117, ty: DataType::Str(10) },
        Field { key: "modbusTableVersion", addr: 122, ty: DataType::U16 },
        Field { key: "firmwareVersion", addr: 123, ty: DataType::Str(34) },
        Field { key: "platformType", addr: 140, ty: DataType::Str(34) },
        Field { key: "serialNumber", addr: 157, ty: DataType::Str(22) },
        Field { key: "clockYear", addr: 168, ty: DataType::I16 },
        Field { key: "clockMonth", addr: 169, ty: DataType::I16 },
        Field { key: "clockDay", addr: 170, ty: DataType::I16 },
        Field { key: "clockHour", addr: 171, ty: DataType::I16 },
        Field { key: "clockMinute", addr: 172, ty: DataType::I16 },
        Field { key: "clockSecond", addr: 173, ty: DataType::I16 },
        Field { key: "uptime", addr: 174, ty: DataType::U64 },
        Field { key: "timezoneOffset", addr: 178, ty: DataType::I16 },
    ],
};

const STATION_STATUS: FieldGroup = FieldGroup {
    name: "station status",
    start: 1100,
    count: 6,
    fields: &[
        Field { key: "actualMaxCurrent", addr: 1100, ty: DataType::F32 },
        Field { key: "temperature", addr: 1102, ty: DataType::F32 },
        Field { key: "backofficeConnected", addr: 1104, ty: DataType::U16 },
        Field { key: "socketCount", addr: 1105, ty: DataType::U16 },
    ],
};

const SOCKET_METER: FieldGroup = FieldGroup {
    name: "socket meter",
    start: 300,
    count: 125,
    fields: &[
        Field { key: "meterState", addr: 300, ty: DataType::U16 },
        Field { key: "meterTimestamp", addr: 301, ty: DataType::U64 },
        Field { key: "meterType", addr: 305, ty: DataType::U16 },
        Field { key: "voltageL1N", addr: 306, ty: DataType::F32 },
        Field { key: "voltageL2N", addr: 308, ty: DataType::F32 },
        Field { key: "voltageL3N", addr: 310, ty: DataType::F32 },
        Field { key: "voltageL1L2", addr: 312, ty: DataType::F32 },
        Field { key: "voltageL2L3", addr: 314, ty: DataType::F32 },
        Field { key: "voltageL3L1", addr: 316, ty: DataType::F32 },
        Field { key: "currentN", addr: 318, ty: DataType::F32 },
        Field { key: "currentL1", addr: 320, ty: DataType::F32 },
        Field { key: "currentL2", addr: 322, ty: DataType::F32 },
        Field { key: "currentL3", addr: 324, ty: DataType::F32 },
        Field { key: "currentSum", addr: 326, ty: DataType::F32 },
        Field { key: "powerFactorL1", addr: 328, ty: DataType::F32 },
        Field { key: "powerFactorL2", addr: 330, ty: DataType::F32 },
        Field { key: "powerFactorL3", addr: 332, ty: DataType::F32 },
        Field { key: "powerFactorSum", addr: 334, ty: DataType::F32 },
        Field { key: "frequency", addr: 336, ty: DataType::F32 },
        Field { key: "realPowerL1", addr: 338, ty: DataType::F32 },
        Field { key: "realPowerL2", addr: 340, ty: DataType::F32 },
        Field { key: "realPowerL3", addr: 342, ty: DataType::F32 },
        Field { key: "realPowerSum", addr: 344, ty: DataType::F32 },
        Field { key: "apparentPowerL1", addr: 346, ty: DataType::F32 },
        Field { key: "apparentPowerL2", addr: 348, ty: DataType::F32 },
        Field { key: "apparentPowerL3", addr: 350, ty: DataType::F32 },
        Field { key: "apparentPowerSum", addr: 352, ty: DataType::F32 },
        Field { key: "reactivePowerL1", addr: 354, ty: DataType::F32 },
        Field { key: "reactivePowerL2", addr: 356, ty: DataType::F32 },
        Field { key: "reactivePowerL3", addr: 358, ty: DataType::F32 },
        Field { key: "reactivePowerSum", addr: 360, ty: DataType::F32 },
        Field { key: "realEnergyDeliveredL1", addr: 362, ty: DataType::F64 },
        Field { key: "realEnergyDeliveredL2", addr: 366, ty: DataType::F64 },
        Field { key: "realEnergyDeliveredL3", addr: 370, ty: DataType::F64 },
        Field { key: "realEnergyDeliveredSum", addr: 374, ty: DataType::F64 },
        Field { key: "realEnergyConsumedL1", addr: 378, ty: DataType::F64 },
        Field { key: "realEnergyConsumedL2", addr: 382, ty: DataType::F64 },
        Field { key: "realEnergyConsumedL3", addr: 386, ty: DataType::F64 },
        Field { key: "realEnergyConsumedSum", addr: 390, ty: DataType::F64 },
        Field { key: "apparentEnergyL1", addr: 392, ty: DataType::F64 },
        Field { key: "apparentEnergyL2", addr: 396, ty: DataType::F64 },
        Field { key: "apparentEnergyL3", addr: 400, ty: DataType::F64 },
        Field { key: "apparentEnergySum", addr: 404, ty: DataType::F64 },
        Field { key: "reactiveEnergyL1", addr: 408, ty: DataType::F64 },
        Field { key: "reactiveEnergyL2", addr: 412, ty: DataType::F64 },
        Field { key: "reactiveEnergyL3", addr: 416, ty: DataType::F64 },
    ],
};

const SOCKET_STATUS: FieldGroup = FieldGroup {
    name: "socket status",
    start: 1200,
    count: 16,
    fields: &[
        Field { key: "availability", addr: 1200, ty: DataType::U16 },
        Field { key: "mode3State", addr: 1201, ty: DataType::Str(10) },
        Field { key: "actualAppliedMaxCurrent", addr: 1206, ty: DataType::F32 },
        Field { key: "maxCurrentValidTime", addr: 1208, ty: DataType::U32 },
        Field { key: "modbusSlaveMaxCurrent", addr: 1210, ty: DataType::F32 },
        Field { key: "activeLoadBalancingSafeCurrent", addr: 1212, ty: DataType::F32 },
        Field { key: "setpointAccounted", addr: 1214, ty: DataType::U16 },
        Field { key: "phases", addr: 1215, ty: DataType::U16 },
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    fn all_groups() -> Vec<&'static FieldGroup> {
        STATION_GROUPS.iter().chain(SOCKET_GROUPS).collect()
    }

    #[test]
    fn fields_lie_within_their_group() {
        for group in all_groups() {
            let end = group.start + group.count;
            for field in group.fields {
                assert!(
                    field.addr >= group.start && field.addr + field.ty.quantity() <= end,
                    "{} field {} escapes {}..{}",
                    group.name,
                    field.key,
                    group.start,
                    end
                );
            }
        }
    }

    #[test]
    fn fields_do_not_overlap() {
        for group in all_groups() {
            for pair in group.fields.windows(2) {
                assert!(
                    pair[0].addr + pair[0].ty.quantity() <= pair[1].addr,
                    "{} overlaps {} in group {}",
                    pair[0].key,
                    pair[1].key,
                    group.name
                );
            }
        }
    }

    #[test]
    fn control_addresses_match_the_table() {
        let status = SOCKET_GROUPS
            .iter()
            .find(|g| g.name == "socket status")
            .unwrap();
        let setpoint = status
            .fields
            .iter()
            .find(|f| f.key == "modbusSlaveMaxCurrent")
            .unwrap();
        let applied = status
            .fields
            .iter()
            .find(|f| f.key == "actualAppliedMaxCurrent")
            .unwrap();
        assert_eq!(setpoint.addr, SLAVE_MAX_CURRENT_ADDR);
        assert_eq!(applied.addr, ACTUAL_APPLIED_MAX_CURRENT_ADDR);
        assert_eq!(setpoint.ty, DataType::F32);
    }

    #[test]
    fn socket_keys_are_prefixed() {
        assert_eq!(socket_key(2, "voltageL1N"), "socket_2_voltageL1N");
    }
}
