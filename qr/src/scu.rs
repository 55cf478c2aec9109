//! The DIMSE Query/Retrieve operations.
//!
//! Every verb follows the same shape:
//! open an association proposing the relevant presentation context,
//! issue the command and its identifier data set,
//! accumulate the streamed responses,
//! and release the association.
//! The call returns only once the association has closed;
//! release completion, not the last pending response,
//! is the completion signal.
//!
//! Failures over the network travel through the returned `Result`;
//! there is no built-in retry.
use std::io::Read;
use std::path::{Path, PathBuf};

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_encoding::TransferSyntax;
use dicom_object::{open_file, InMemDicomObject, OpenFileOptions};
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use snafu::{ensure, IntoError, OptionExt, ResultExt};
use tracing::{debug, warn};

use pacslink_ul::pdu::{PDataValue, PDataValueType, Pdu};

use crate::cancel::CancellationToken;
use crate::commands::{self, is_pending};
use crate::connection::{AssociateOptions, ConnectionManager, ManagedAssociation};
use crate::error::{
    CancelledSnafu, CreateCommandSnafu, Error, MissingNegotiatedContextSnafu,
    MissingResponseAttributeSnafu, MissingResponseStatusSnafu, OpenFileSnafu,
    OperationFailedSnafu, ReadResponseDataSnafu, ReadResponseSnafu, Result, SendDataSnafu,
    TransportSnafu, UnexpectedResponseSnafu, UnsupportedTransferSyntaxSnafu,
};
use crate::query::{
    merge_query, QueryParams, INSTANCE_TEMPLATE, PATIENT_TEMPLATE, SERIES_TEMPLATE,
    STUDY_TEMPLATE,
};

/// Options shared by the retrieval operations.
#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    /// AE title of the target peer;
    /// the default peer is used when unset
    pub peer: Option<String>,
    /// cancellation flag checked between response messages
    pub cancellation: Option<CancellationToken>,
}

/// Options for the C-MOVE operation.
#[derive(Debug, Clone, Default)]
pub struct MoveOptions {
    /// AE title of the target peer;
    /// the default peer is used when unset
    pub peer: Option<String>,
    /// AE title the sub-operations are directed at;
    /// this node's server peer is used when unset
    pub destination: Option<String>,
    /// cancellation flag checked between response messages
    pub cancellation: Option<CancellationToken>,
}

fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
    ]
}

fn cancelled(token: &Option<CancellationToken>) -> bool {
    token.as_ref().is_some_and(CancellationToken::is_cancelled)
}

/// A file checked for transfer, with what its meta group declares.
struct StoreTarget {
    path: PathBuf,
    sop_class_uid: String,
    sop_instance_uid: String,
    transfer_syntax: String,
}

/// Encode a command set with Implicit VR Little Endian.
fn encode_command(cmd: &InMemDicomObject) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(128);
    cmd.write_dataset_with_ts(&mut data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(Box::from)
        .context(CreateCommandSnafu)?;
    Ok(data)
}

/// Encode a data set with the negotiated transfer syntax.
fn encode_dataset(obj: &InMemDicomObject, ts: &TransferSyntax) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(128);
    obj.write_dataset_with_ts(&mut data, ts)
        .map_err(Box::from)
        .context(CreateCommandSnafu)?;
    Ok(data)
}

fn read_command(data: &[u8]) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .context(ReadResponseSnafu)
}

fn command_status(cmd_obj: &InMemDicomObject) -> Result<u16> {
    cmd_obj
        .get(tags::STATUS)
        .and_then(|e| e.to_int::<u16>().ok())
        .context(MissingResponseStatusSnafu)
}

fn string_attribute(obj: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<String> {
    let value = obj
        .get(tag)
        .and_then(|e| e.to_str().ok())
        .context(MissingResponseAttributeSnafu { name })?;
    Ok(value.trim_end_matches(['\0', ' ']).to_string())
}

impl ConnectionManager {
    /// Query the default or selected peer for patients.
    ///
    /// Non-empty caller parameters become match keys;
    /// the returned records carry the attributes of the patient template.
    pub fn retrieve_patients(
        &self,
        params: &QueryParams,
        options: &RetrieveOptions,
    ) -> Result<Vec<InMemDicomObject>> {
        let identifier = merge_query(PATIENT_TEMPLATE, "PATIENT", params);
        self.find(
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            identifier,
            options,
        )
    }

    /// Query the default or selected peer for studies.
    pub fn retrieve_studies(
        &self,
        params: &QueryParams,
        options: &RetrieveOptions,
    ) -> Result<Vec<InMemDicomObject>> {
        let identifier = merge_query(STUDY_TEMPLATE, "STUDY", params);
        self.find(
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            identifier,
            options,
        )
    }

    /// Query for the series of a study.
    pub fn retrieve_series(
        &self,
        study_instance_uid: &str,
        params: &QueryParams,
        options: &RetrieveOptions,
    ) -> Result<Vec<InMemDicomObject>> {
        let mut identifier = merge_query(SERIES_TEMPLATE, "SERIES", params);
        identifier.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_instance_uid),
        ));
        self.find(
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            identifier,
            options,
        )
    }

    /// Query for the instances of one series of a study.
    pub fn retrieve_instances(
        &self,
        study_instance_uid: &str,
        series_instance_uid: &str,
        params: &QueryParams,
        options: &RetrieveOptions,
    ) -> Result<Vec<InMemDicomObject>> {
        let mut identifier = merge_query(INSTANCE_TEMPLATE, "IMAGE", params);
        identifier.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_instance_uid),
        ));
        identifier.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(series_instance_uid),
        ));
        self.find(
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            identifier,
            options,
        )
    }

    /// Retrieve all instances of a study, series by series,
    /// returning the aggregate list.
    pub fn retrieve_instances_by_study(
        &self,
        study_instance_uid: &str,
        params: &QueryParams,
        options: &RetrieveOptions,
    ) -> Result<Vec<InMemDicomObject>> {
        let mut all = Vec::new();
        self.retrieve_instances_by_study_with(
            study_instance_uid,
            params,
            options,
            |instances, _is_last| {
                all.extend_from_slice(instances);
            },
        )?;
        Ok(all)
    }

    /// Retrieve all instances of a study, series by series,
    /// streaming each batch through the callback.
    ///
    /// The callback receives the instances found for one series and
    /// whether that series was the last one of the study,
    /// so that callers can use partial results while still
    /// knowing when the study is exhausted.
    /// All queries run over a single association,
    /// which is released exactly once, on exhaustion.
    pub fn retrieve_instances_by_study_with<F>(
        &self,
        study_instance_uid: &str,
        params: &QueryParams,
        options: &RetrieveOptions,
        mut on_series: F,
    ) -> Result<()>
    where
        F: FnMut(&[InMemDicomObject], bool),
    {
        let abstract_syntax = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;
        let mut association = self.associate(AssociateOptions {
            peer: options.peer.clone(),
            presentation_contexts: vec![(
                abstract_syntax.to_string(),
                default_transfer_syntaxes(),
            )],
        })?;

        let outcome = (|| -> Result<()> {
            let mut series_identifier =
                merge_query(SERIES_TEMPLATE, "SERIES", &QueryParams::new());
            series_identifier.put(DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(study_instance_uid),
            ));
            let series = self.find_on(
                &mut association,
                abstract_syntax,
                &series_identifier,
                &options.cancellation,
            )?;

            let total = series.len();
            if total == 0 {
                on_series(&[], true);
                return Ok(());
            }
            for (index, series_row) in series.iter().enumerate() {
                let series_instance_uid = string_attribute(
                    series_row,
                    tags::SERIES_INSTANCE_UID,
                    "SeriesInstanceUID",
                )?;

                let mut identifier = merge_query(INSTANCE_TEMPLATE, "IMAGE", params);
                identifier.put(DataElement::new(
                    tags::STUDY_INSTANCE_UID,
                    VR::UI,
                    PrimitiveValue::from(study_instance_uid),
                ));
                identifier.put(DataElement::new(
                    tags::SERIES_INSTANCE_UID,
                    VR::UI,
                    PrimitiveValue::from(series_instance_uid.as_str()),
                ));
                let instances = self.find_on(
                    &mut association,
                    abstract_syntax,
                    &identifier,
                    &options.cancellation,
                )?;
                on_series(&instances, index + 1 == total);
            }
            Ok(())
        })();

        finish(association, outcome)
    }

    /// Request the peer to move instances to another application entity.
    ///
    /// Proposes both the Study Root MOVE context and the instances'
    /// SOP class, and directs the sub-operations at this node's
    /// server peer unless an explicit destination is given.
    /// No results are accumulated;
    /// the instances themselves arrive at the destination
    /// through separate inbound associations.
    pub fn move_instances(
        &self,
        study_instance_uid: &str,
        series_instance_uid: &str,
        sop_instance_uid: &str,
        sop_class_uid: &str,
        params: &QueryParams,
        options: &MoveOptions,
    ) -> Result<()> {
        let abstract_syntax = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE;
        let destination = match &options.destination {
            Some(destination) => destination.clone(),
            None => self.server_peer()?.ae_title,
        };

        let mut association = self.associate(AssociateOptions {
            peer: options.peer.clone(),
            presentation_contexts: vec![
                (abstract_syntax.to_string(), default_transfer_syntaxes()),
                (sop_class_uid.to_string(), default_transfer_syntaxes()),
            ],
        })?;

        let outcome = (|| -> Result<()> {
            let pc = association
                .presentation_context_for(abstract_syntax)
                .cloned()
                .context(MissingNegotiatedContextSnafu { abstract_syntax })?;
            let ts = TransferSyntaxRegistry
                .get(&pc.transfer_syntax)
                .context(UnsupportedTransferSyntaxSnafu {
                    uid: pc.transfer_syntax.clone(),
                })?;

            let message_id = association.next_message_id();
            let cmd = commands::move_rq(abstract_syntax, &destination, message_id);

            let mut identifier = merge_query(&[], "IMAGE", params);
            identifier.put(DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(study_instance_uid),
            ));
            identifier.put(DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(series_instance_uid),
            ));
            identifier.put(DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(sop_instance_uid),
            ));

            association
                .send(&Pdu::PData {
                    data: vec![
                        PDataValue {
                            presentation_context_id: pc.id,
                            value_type: PDataValueType::Command,
                            is_last: true,
                            data: encode_command(&cmd)?,
                        },
                        PDataValue {
                            presentation_context_id: pc.id,
                            value_type: PDataValueType::Data,
                            is_last: true,
                            data: encode_dataset(&identifier, ts)?,
                        },
                    ],
                })
                .context(TransportSnafu)?;

            // drain the move responses without accumulating anything;
            // the moved instances surface at the destination node
            loop {
                ensure!(!cancelled(&options.cancellation), CancelledSnafu);
                let pdu = association.receive().context(TransportSnafu)?;
                match pdu {
                    Pdu::PData { data } => {
                        ensure!(!data.is_empty(), MissingResponseStatusSnafu);
                        let cmd_obj = read_command(&data[0].data)?;
                        let status = command_status(&cmd_obj)?;
                        if is_pending(status) {
                            continue;
                        }
                        ensure!(status == 0, OperationFailedSnafu { status });
                        return Ok(());
                    }
                    pdu => return UnexpectedResponseSnafu { pdu }.fail(),
                }
            }
        })();

        finish(association, outcome)
    }

    /// Store DICOM files on the default or selected peer.
    ///
    /// The unit of progress is a file:
    /// `on_file` is invoked once per input file, in order,
    /// with the outcome of storing that file.
    /// Transport failures mid-transfer abort the whole operation.
    pub fn store_instances<F>(
        &self,
        files: &[PathBuf],
        options: &RetrieveOptions,
        mut on_file: F,
    ) -> Result<()>
    where
        F: FnMut(Result<()>, &Path),
    {
        // inspect the file metas first to know which contexts to propose
        let mut store_files: Vec<StoreTarget> = Vec::new();
        let mut contexts: Vec<(String, Vec<String>)> = Vec::new();
        for path in files {
            let meta = match OpenFileOptions::new()
                .read_until(Tag(0x0001, 0x0000))
                .open_file(path)
            {
                Ok(obj) => obj.meta().clone(),
                Err(e) => {
                    on_file(
                        Err(OpenFileSnafu { path: path.clone() }.into_error(e)),
                        path,
                    );
                    continue;
                }
            };

            let sop_class_uid = meta.media_storage_sop_class_uid.trim_end_matches('\0').to_string();
            let sop_instance_uid = meta
                .media_storage_sop_instance_uid
                .trim_end_matches('\0')
                .to_string();
            let transfer_syntax = meta.transfer_syntax.trim_end_matches('\0').to_string();

            // propose the file's own transfer syntax,
            // plus the uncompressed ones as mandated by the standard
            for ts in [
                transfer_syntax.clone(),
                uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            ] {
                let context = (sop_class_uid.clone(), vec![ts]);
                if !contexts.contains(&context) {
                    contexts.push(context);
                }
            }

            store_files.push(StoreTarget {
                path: path.clone(),
                sop_class_uid,
                sop_instance_uid,
                transfer_syntax,
            });
        }

        if store_files.is_empty() {
            return Ok(());
        }

        let mut association = self.associate(AssociateOptions {
            peer: options.peer.clone(),
            presentation_contexts: contexts,
        })?;

        let outcome = (|| -> Result<()> {
            for file in &store_files {
                ensure!(!cancelled(&options.cancellation), CancelledSnafu);

                let result = self.store_one(&mut association, file);
                match result {
                    Ok(()) => on_file(Ok(()), &file.path),
                    // a failed status only fails this file
                    Err(e @ Error::OperationFailed { .. })
                    | Err(e @ Error::MissingNegotiatedContext { .. })
                    | Err(e @ Error::UnsupportedTransferSyntax { .. })
                    | Err(e @ Error::OpenFile { .. }) => on_file(Err(e), &file.path),
                    // everything else poisons the association
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })();

        finish(association, outcome)
    }

    /// Verify connectivity with the default or selected peer (C-ECHO).
    pub fn echo(&self, options: &RetrieveOptions) -> Result<()> {
        let abstract_syntax = uids::VERIFICATION;
        let mut association = self.associate(AssociateOptions {
            peer: options.peer.clone(),
            presentation_contexts: vec![(
                abstract_syntax.to_string(),
                default_transfer_syntaxes(),
            )],
        })?;

        let outcome = (|| -> Result<()> {
            let pc = association
                .presentation_context_for(abstract_syntax)
                .cloned()
                .context(MissingNegotiatedContextSnafu { abstract_syntax })?;
            let message_id = association.next_message_id();
            let cmd = commands::echo_rq(message_id);

            association
                .send(&Pdu::PData {
                    data: vec![PDataValue {
                        presentation_context_id: pc.id,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: encode_command(&cmd)?,
                    }],
                })
                .context(TransportSnafu)?;

            let pdu = association.receive().context(TransportSnafu)?;
            match pdu {
                Pdu::PData { data } => {
                    ensure!(!data.is_empty(), MissingResponseStatusSnafu);
                    let cmd_obj = read_command(&data[0].data)?;
                    let status = command_status(&cmd_obj)?;
                    ensure!(status == 0, OperationFailedSnafu { status });
                    Ok(())
                }
                pdu => UnexpectedResponseSnafu { pdu }.fail(),
            }
        })();

        finish(association, outcome)
    }

    /// The common C-FIND flow over a dedicated association.
    fn find(
        &self,
        abstract_syntax: &str,
        identifier: InMemDicomObject,
        options: &RetrieveOptions,
    ) -> Result<Vec<InMemDicomObject>> {
        let mut association = self.associate(AssociateOptions {
            peer: options.peer.clone(),
            presentation_contexts: vec![(
                abstract_syntax.to_string(),
                default_transfer_syntaxes(),
            )],
        })?;

        let outcome = self.find_on(
            &mut association,
            abstract_syntax,
            &identifier,
            &options.cancellation,
        );
        finish(association, outcome)
    }

    /// Issue one C-FIND over an already established association
    /// and accumulate the streamed result rows.
    fn find_on(
        &self,
        association: &mut ManagedAssociation,
        abstract_syntax: &str,
        identifier: &InMemDicomObject,
        cancellation: &Option<CancellationToken>,
    ) -> Result<Vec<InMemDicomObject>> {
        let pc = association
            .presentation_context_for(abstract_syntax)
            .cloned()
            .context(MissingNegotiatedContextSnafu { abstract_syntax })?;
        let ts = TransferSyntaxRegistry
            .get(&pc.transfer_syntax)
            .context(UnsupportedTransferSyntaxSnafu {
                uid: pc.transfer_syntax.clone(),
            })?;

        let message_id = association.next_message_id();
        let cmd = commands::find_rq(abstract_syntax, message_id);

        association
            .send(&Pdu::PData {
                data: vec![
                    PDataValue {
                        presentation_context_id: pc.id,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: encode_command(&cmd)?,
                    },
                    PDataValue {
                        presentation_context_id: pc.id,
                        value_type: PDataValueType::Data,
                        is_last: true,
                        data: encode_dataset(identifier, ts)?,
                    },
                ],
            })
            .context(TransportSnafu)?;

        let mut results = Vec::new();
        loop {
            ensure!(!cancelled(cancellation), CancelledSnafu);

            let pdu = association.receive().context(TransportSnafu)?;
            match pdu {
                Pdu::PData { data } => {
                    ensure!(!data.is_empty(), MissingResponseStatusSnafu);
                    let cmd_obj = read_command(&data[0].data)?;
                    let status = command_status(&cmd_obj)?;

                    if status == 0 {
                        debug!("matching complete: {} results", results.len());
                        break;
                    } else if is_pending(status) {
                        // some peers send command and data in one P-DATA-TF,
                        // others stream the data set in further PDUs
                        let row = if let Some(second) = data.get(1) {
                            InMemDicomObject::read_dataset_with_ts(&second.data[..], ts)
                                .context(ReadResponseSnafu)?
                        } else {
                            let mut response_data = Vec::new();
                            association
                                .receive_pdata()
                                .read_to_end(&mut response_data)
                                .context(ReadResponseDataSnafu)?;
                            InMemDicomObject::read_dataset_with_ts(&response_data[..], ts)
                                .context(ReadResponseSnafu)?
                        };
                        results.push(row);
                    } else {
                        return OperationFailedSnafu { status }.fail();
                    }
                }
                pdu => return UnexpectedResponseSnafu { pdu }.fail(),
            }
        }
        Ok(results)
    }

    /// Store one file over the established association.
    fn store_one(&self, association: &mut ManagedAssociation, file: &StoreTarget) -> Result<()> {
        let pcs = association.presentation_contexts_for(&file.sop_class_uid);
        let file_ts = TransferSyntaxRegistry
            .get(&file.transfer_syntax)
            .context(UnsupportedTransferSyntaxSnafu {
                uid: file.transfer_syntax.clone(),
            })?;

        // prefer the file's own transfer syntax;
        // fall back to an uncompressed one when both ends are codec free
        let pc = pcs
            .iter()
            .find(|pc| pc.transfer_syntax == file.transfer_syntax)
            .or_else(|| {
                pcs.iter().find(|pc| {
                    TransferSyntaxRegistry
                        .get(&pc.transfer_syntax)
                        .filter(|ts| file_ts.is_codec_free() && ts.is_codec_free())
                        .is_some()
                })
            })
            .cloned()
            .context(MissingNegotiatedContextSnafu {
                abstract_syntax: file.sop_class_uid.clone(),
            })?;
        let ts_selected = TransferSyntaxRegistry
            .get(&pc.transfer_syntax)
            .context(UnsupportedTransferSyntaxSnafu {
                uid: pc.transfer_syntax.clone(),
            })?;

        let obj = open_file(&file.path).context(OpenFileSnafu {
            path: file.path.clone(),
        })?;

        let message_id = association.next_message_id();
        let cmd = commands::store_rq(&file.sop_class_uid, &file.sop_instance_uid, message_id);
        association
            .send(&Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: pc.id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: encode_command(&cmd)?,
                }],
            })
            .context(TransportSnafu)?;

        // stream the data set, splitting into PDUs as needed
        {
            let mut pdata = association.send_pdata(pc.id);
            obj.write_dataset_with_ts(&mut pdata, ts_selected)
                .map_err(Box::from)
                .context(CreateCommandSnafu)?;
            pdata.finish().context(SendDataSnafu)?;
        }

        let pdu = association.receive().context(TransportSnafu)?;
        match pdu {
            Pdu::PData { data } => {
                ensure!(!data.is_empty(), MissingResponseStatusSnafu);
                let cmd_obj = read_command(&data[0].data)?;
                let status = command_status(&cmd_obj)?;
                match status {
                    0 => Ok(()),
                    // warnings still mean the instance was stored
                    0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => {
                        warn!(
                            "possible issue storing instance `{}` (status code {:04X}H)",
                            file.sop_instance_uid, status
                        );
                        Ok(())
                    }
                    status => OperationFailedSnafu { status }.fail(),
                }
            }
            pdu => UnexpectedResponseSnafu { pdu }.fail(),
        }
    }
}

/// Release the association on success and abort it on failure,
/// then surface the operation's outcome.
///
/// The association's shutdown is what completes the operation either way.
fn finish<T>(association: ManagedAssociation, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            if let Err(e) = association.release() {
                warn!("association release failed: {}", e);
            }
            Ok(value)
        }
        Err(e) => {
            let _ = association.abort();
            Err(e)
        }
    }
}
