//! DIMSE command set builders.
//!
//! Command sets are small DICOM datasets in the command group,
//! always encoded with Implicit VR Little Endian
//! regardless of the negotiated transfer syntax of the data sets.
use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};

/// C-FIND-RQ command field code
pub const C_FIND_RQ: u16 = 0x0020;
/// C-MOVE-RQ command field code
pub const C_MOVE_RQ: u16 = 0x0021;
/// C-STORE-RQ command field code
pub const C_STORE_RQ: u16 = 0x0001;
/// C-ECHO-RQ command field code
pub const C_ECHO_RQ: u16 = 0x0030;

/// Command data set type: a data set follows the command set
pub const DATA_SET_PRESENT: u16 = 0x0001;
/// Command data set type: no data set follows
pub const DATA_SET_ABSENT: u16 = 0x0101;

/// medium priority
const PRIORITY_MEDIUM: u16 = 0x0000;

/// The status codes which indicate that more responses are coming.
pub fn is_pending(status: u16) -> bool {
    status == 0xFF00 || status == 0xFF01
}

/// Build a C-FIND-RQ command set.
pub fn find_rq(sop_class_uid: &str, message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [C_FIND_RQ]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::PRIORITY,
            VR::US,
            dicom_value!(U16, [PRIORITY_MEDIUM]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
    ])
}

/// Build a C-MOVE-RQ command set
/// directing the sub-operations at `move_destination`.
pub fn move_rq(
    sop_class_uid: &str,
    move_destination: &str,
    message_id: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [C_MOVE_RQ]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::PRIORITY,
            VR::US,
            dicom_value!(U16, [PRIORITY_MEDIUM]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            PrimitiveValue::from(move_destination),
        ),
    ])
}

/// Build a C-STORE-RQ command set.
pub fn store_rq(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    message_id: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [C_STORE_RQ]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::PRIORITY,
            VR::US,
            dicom_value!(U16, [PRIORITY_MEDIUM]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid),
        ),
    ])
}

/// Build a C-ECHO-RQ command set.
pub fn echo_rq(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(dicom_dictionary_std::uids::VERIFICATION),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [C_ECHO_RQ]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_ABSENT]),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_command_carries_the_query_verbs() {
        let cmd = find_rq("1.2.840.10008.5.1.4.1.2.2.1", 7);
        assert_eq!(
            cmd.get(tags::COMMAND_FIELD)
                .unwrap()
                .to_int::<u16>()
                .unwrap(),
            C_FIND_RQ
        );
        assert_eq!(
            cmd.get(tags::MESSAGE_ID).unwrap().to_int::<u16>().unwrap(),
            7
        );
        assert_eq!(
            cmd.get(tags::COMMAND_DATA_SET_TYPE)
                .unwrap()
                .to_int::<u16>()
                .unwrap(),
            DATA_SET_PRESENT
        );
    }

    #[test]
    fn move_command_names_the_destination() {
        let cmd = move_rq("1.2.840.10008.5.1.4.1.2.2.2", "STORE-SCP", 1);
        assert_eq!(
            cmd.get(tags::MOVE_DESTINATION).unwrap().to_str().unwrap(),
            "STORE-SCP"
        );
    }

    #[test]
    fn echo_command_has_no_data_set() {
        let cmd = echo_rq(1);
        assert_eq!(
            cmd.get(tags::COMMAND_DATA_SET_TYPE)
                .unwrap()
                .to_int::<u16>()
                .unwrap(),
            DATA_SET_ABSENT
        );
    }

    #[test]
    fn pending_statuses() {
        assert!(is_pending(0xFF00));
        assert!(is_pending(0xFF01));
        assert!(!is_pending(0x0000));
        assert!(!is_pending(0xA700));
    }
}
