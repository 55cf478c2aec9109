//! Query parameter templates and merging.
//!
//! Every query level has a default template declaring
//! which attributes are requested from the peer.
//! Caller-supplied parameters are merged over the template:
//! non-empty values become match keys,
//! while every template key stays in the outgoing identifier
//! as an empty return key, per C-FIND semantics.
use std::collections::BTreeMap;

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

/// Caller-supplied query parameters:
/// DICOM attribute to match value.
pub type QueryParams = BTreeMap<Tag, String>;

/// Attributes requested for patient-level queries.
pub(crate) static PATIENT_TEMPLATE: &[(Tag, VR)] = &[
    (tags::PATIENT_NAME, VR::PN),
    (tags::PATIENT_ID, VR::LO),
    (tags::PATIENT_BIRTH_DATE, VR::DA),
    (tags::PATIENT_SEX, VR::CS),
    (tags::NUMBER_OF_PATIENT_RELATED_STUDIES, VR::IS),
];

/// Attributes requested for study-level queries.
pub(crate) static STUDY_TEMPLATE: &[(Tag, VR)] = &[
    (tags::STUDY_INSTANCE_UID, VR::UI),
    (tags::STUDY_DATE, VR::DA),
    (tags::STUDY_TIME, VR::TM),
    (tags::ACCESSION_NUMBER, VR::SH),
    (tags::PATIENT_NAME, VR::PN),
    (tags::PATIENT_ID, VR::LO),
    (tags::STUDY_ID, VR::SH),
    (tags::STUDY_DESCRIPTION, VR::LO),
    (tags::MODALITIES_IN_STUDY, VR::CS),
    (tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS),
    (tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS),
];

/// Attributes requested for series-level queries.
pub(crate) static SERIES_TEMPLATE: &[(Tag, VR)] = &[
    (tags::SERIES_INSTANCE_UID, VR::UI),
    (tags::STUDY_INSTANCE_UID, VR::UI),
    (tags::SERIES_NUMBER, VR::IS),
    (tags::SERIES_DESCRIPTION, VR::LO),
    (tags::MODALITY, VR::CS),
    (tags::SERIES_DATE, VR::DA),
    (tags::SERIES_TIME, VR::TM),
    (tags::NUMBER_OF_SERIES_RELATED_INSTANCES, VR::IS),
];

/// Attributes requested for instance-level queries.
pub(crate) static INSTANCE_TEMPLATE: &[(Tag, VR)] = &[
    (tags::SOP_INSTANCE_UID, VR::UI),
    (tags::SOP_CLASS_UID, VR::UI),
    (tags::STUDY_INSTANCE_UID, VR::UI),
    (tags::SERIES_INSTANCE_UID, VR::UI),
    (tags::INSTANCE_NUMBER, VR::IS),
    (tags::NUMBER_OF_FRAMES, VR::IS),
];

/// Merge caller parameters over a level template into a C-FIND identifier.
///
/// Every template key is present in the result;
/// caller values override the empty placeholders,
/// and parameters outside the template are carried along as extra
/// match keys.
pub(crate) fn merge_query(
    template: &[(Tag, VR)],
    level: &str,
    params: &QueryParams,
) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from(level),
    ));

    for (tag, vr) in template {
        let value = match params.get(tag) {
            Some(value) => PrimitiveValue::from(value.as_str()),
            None => PrimitiveValue::Empty,
        };
        obj.put(DataElement::new(*tag, *vr, value));
    }

    for (tag, value) in params {
        let in_template = template.iter().any(|(t, _)| t == tag);
        if !in_template && *tag != tags::QUERY_RETRIEVE_LEVEL {
            // attributes outside the template are matched as plain text
            obj.put(DataElement::new(
                *tag,
                VR::LO,
                PrimitiveValue::from(value.as_str()),
            ));
        }
    }

    obj
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_query_keeps_all_template_keys() {
        let mut params = QueryParams::new();
        params.insert(tags::PATIENT_ID, "12345".to_string());

        let obj = merge_query(STUDY_TEMPLATE, "STUDY", &params);

        // the match key was overridden
        assert_eq!(
            obj.get(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "12345"
        );
        // the level is declared
        assert_eq!(
            obj.get(tags::QUERY_RETRIEVE_LEVEL)
                .unwrap()
                .to_str()
                .unwrap(),
            "STUDY"
        );
        // every other template key is present as an empty return key
        for (tag, _) in STUDY_TEMPLATE {
            let element = obj.get(*tag).expect("template key must be present");
            if *tag != tags::PATIENT_ID {
                assert!(element.to_str().unwrap().is_empty());
            }
        }
    }

    #[test]
    fn extra_parameters_become_match_keys() {
        let mut params = QueryParams::new();
        params.insert(tags::REFERRING_PHYSICIAN_NAME, "DOE^JANE".to_string());

        let obj = merge_query(STUDY_TEMPLATE, "STUDY", &params);
        assert_eq!(
            obj.get(tags::REFERRING_PHYSICIAN_NAME)
                .unwrap()
                .to_str()
                .unwrap(),
            "DOE^JANE"
        );
    }
}
