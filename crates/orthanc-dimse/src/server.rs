use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::server::ServerAssociation;
use dicom_ul::pdu::PDataValueType;
use dicom_ul::{association::ServerAssociationOptions, Pdu};

use orthanc_core::{DicomTag, TagValue};

use crate::handler::{
    AnswerSet, FindRequestHandler, GetRequestHandler, GetStepStatus, Identifier, MoveRequestHandler,
    StoreRequestHandler, WorklistRequestHandler,
};
use crate::scp::{fixup_worklist_query, FindState, GetState, MoveState, WorklistQuery};
use crate::status::DimseStatus;

/// Modality Worklist Information Model - FIND, the SOP class a C-FIND-RQ
/// must carry as its affected SOP class UID to be routed to the worklist
/// handler instead of the regular one (spec.md §4.I scenario 4).
const MODALITY_WORKLIST_FIND_SOP_CLASS_UID: &str = "1.2.840.10008.5.1.4.31";

const COMMAND_FIELD_C_STORE_RQ: u16 = 0x0001;
const COMMAND_FIELD_C_STORE_RSP: u16 = 0x8001;
const COMMAND_FIELD_C_GET_RQ: u16 = 0x0010;
const COMMAND_FIELD_C_GET_RSP: u16 = 0x8010;
const COMMAND_FIELD_C_FIND_RQ: u16 = 0x0020;
const COMMAND_FIELD_C_FIND_RSP: u16 = 0x8020;
const COMMAND_FIELD_C_MOVE_RQ: u16 = 0x0021;
const COMMAND_FIELD_C_MOVE_RSP: u16 = 0x8021;
const COMMAND_FIELD_C_ECHO_RQ: u16 = 0x0030;
const COMMAND_FIELD_C_ECHO_RSP: u16 = 0x8030;

/// The handlers a single accepted association dispatches into — the
/// boundary spec.md §4.J calls out between the wire protocol and E/F.
/// `move_handler`/`get_handler_factory` are optional: a server that never
/// configures a Q/R retrieve role still answers C-ECHO/C-STORE/C-FIND.
pub struct ScpHandlers {
    pub store: Arc<dyn StoreRequestHandler>,
    pub find: Arc<dyn FindRequestHandler>,
    /// Answers Modality Worklist C-FIND-RQs (affected SOP class UID
    /// `1.2.840.10008.5.1.4.31`); a server that never configures one answers
    /// `ErrorCannotUnderstand` to worklist queries while still answering
    /// regular C-FIND through `find`.
    pub worklist: Option<Arc<dyn WorklistRequestHandler>>,
    pub move_handler: Option<Arc<dyn MoveRequestHandler>>,
    /// C-GET state lives on the handler object itself (spec.md §4.I); a
    /// fresh one is built per request so concurrent associations don't share
    /// sub-operation counters.
    pub get_handler_factory: Option<Arc<dyn Fn() -> Box<dyn GetRequestHandler> + Send + Sync>>,
}

/// Accept DIMSE associations on `listener` forever, spawning one
/// `std::thread` per connection (spec.md §5 "Many incoming DICOM
/// association threads, each driving one SCP callback chain"). Grounded
/// directly on the ingwinlu-dicom-rs `storescp` example's accept loop,
/// generalized from a store-only dispatcher into one covering C-ECHO,
/// C-STORE, C-FIND, C-MOVE, and C-GET.
pub fn accept_loop(listener: TcpListener, aet: String, handlers: Arc<ScpHandlers>) {
    for stream in listener.incoming() {
        match stream {
            Ok(scu_stream) => {
                let aet = aet.clone();
                let handlers = Arc::clone(&handlers);
                std::thread::spawn(move || {
                    if let Err(e) = serve_association(scu_stream, &aet, &handlers) {
                        tracing::warn!(error = %e, "DICOM association ended with an error");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "failed to accept incoming connection"),
        }
    }
}

fn serve_association(
    scu_stream: TcpStream,
    aet: &str,
    handlers: &ScpHandlers,
) -> Result<(), crate::error::DimseError> {
    let mut options = ServerAssociationOptions::new().accept_any().ae_title(aet);
    for ts in TransferSyntaxRegistry.iter() {
        if !ts.unsupported() {
            options = options.with_transfer_syntax(ts.uid());
        }
    }

    let mut association = options.establish(scu_stream)?;
    tracing::info!(remote = %association.client_ae_title(), "accepted DICOM association");

    let mut instance_buffer: Vec<u8> = Vec::new();
    let mut command_field: u16 = 0;
    let mut msg_id: u16 = 0;
    let mut affected_sop_class_uid = String::new();
    let mut affected_sop_instance_uid = String::new();
    let mut move_destination = String::new();

    loop {
        match association.receive() {
            Ok(Pdu::PData { mut data }) => {
                if data.is_empty() {
                    continue;
                }
                let value = &mut data[0];
                if value.value_type == PDataValueType::Command && value.is_last {
                    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
                    let cmd = InMemDicomObject::read_dataset_with_ts(value.data.as_slice(), &ts)
                        .map_err(|e| crate::error::DimseError::Malformed(e.to_string()))?;
                    command_field = read_u16(&cmd, tags::COMMAND_FIELD).unwrap_or(0);
                    msg_id = read_u16(&cmd, tags::MESSAGE_ID).unwrap_or(0);
                    affected_sop_class_uid = read_str(&cmd, tags::AFFECTED_SOP_CLASS_UID).unwrap_or_default();
                    affected_sop_instance_uid = read_str(&cmd, tags::AFFECTED_SOP_INSTANCE_UID).unwrap_or_default();
                    move_destination = read_str(&cmd, tags::MOVE_DESTINATION).unwrap_or_default();
                    instance_buffer.clear();

                    if command_field == COMMAND_FIELD_C_ECHO_RQ {
                        send_simple_response(
                            &mut association,
                            value.presentation_context_id,
                            COMMAND_FIELD_C_ECHO_RSP,
                            msg_id,
                            DimseStatus::Success,
                        )?;
                    }
                    // C-STORE/C-FIND/C-MOVE/C-GET all carry an Identifier/dataset in the
                    // Data PDV(s) that follow; dispatch waits for that below so the
                    // handler sees what the SCU actually sent instead of an empty query.
                } else if value.value_type == PDataValueType::Data {
                    instance_buffer.append(&mut value.data);
                    if !value.is_last {
                        continue;
                    }
                    let pc_id = value.presentation_context_id;
                    let ts_uid = association
                        .presentation_contexts()
                        .iter()
                        .find(|pc| pc.id == pc_id)
                        .map(|pc| pc.transfer_syntax.clone())
                        .unwrap_or_default();

                    if command_field == COMMAND_FIELD_C_STORE_RQ {
                        handle_c_store_end(
                            &mut association,
                            pc_id,
                            msg_id,
                            &ts_uid,
                            &instance_buffer,
                            &affected_sop_class_uid,
                            &affected_sop_instance_uid,
                            handlers.store.as_ref(),
                        )?;
                    } else if command_field == COMMAND_FIELD_C_FIND_RQ {
                        let identifier_obj = decode_identifier(&ts_uid, &instance_buffer)?;
                        handle_c_find(&mut association, pc_id, msg_id, &affected_sop_class_uid, &identifier_obj, handlers)?;
                    } else if command_field == COMMAND_FIELD_C_MOVE_RQ {
                        match handlers.move_handler.as_deref() {
                            Some(handler) => {
                                let identifier_obj = decode_identifier(&ts_uid, &instance_buffer)?;
                                let query = project_identifier(&identifier_obj);
                                handle_c_move(&mut association, pc_id, msg_id, &move_destination, &query, handler)?
                            }
                            None => send_simple_response(
                                &mut association,
                                pc_id,
                                COMMAND_FIELD_C_MOVE_RSP,
                                msg_id,
                                DimseStatus::ErrorCannotUnderstand,
                            )?,
                        }
                    } else if command_field == COMMAND_FIELD_C_GET_RQ {
                        match handlers.get_handler_factory.as_deref() {
                            Some(factory) => {
                                let identifier_obj = decode_identifier(&ts_uid, &instance_buffer)?;
                                let query = project_identifier(&identifier_obj);
                                handle_c_get(&mut association, pc_id, msg_id, &query, factory)?
                            }
                            None => send_simple_response(
                                &mut association,
                                pc_id,
                                COMMAND_FIELD_C_GET_RSP,
                                msg_id,
                                DimseStatus::ErrorCannotUnderstand,
                            )?,
                        }
                    }
                    instance_buffer.clear();
                }
            }
            Ok(Pdu::ReleaseRQ) => {
                let _ = association.send(&Pdu::ReleaseRP);
                tracing::info!(remote = %association.client_ae_title(), "released DICOM association");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "association closed");
                return Ok(());
            }
        }
    }
}

fn read_u16(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<u16> {
    obj.element(tag).ok()?.to_int().ok()
}

fn read_str(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    obj.element(tag).ok()?.to_str().ok().map(|s| s.trim_end_matches('\0').to_string())
}

/// Decode the Data PDV bytes an Identifier dataset was sent as, using the
/// transfer syntax negotiated for its presentation context.
fn decode_identifier(transfer_syntax_uid: &str, bytes: &[u8]) -> Result<InMemDicomObject, crate::error::DimseError> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .ok_or_else(|| crate::error::DimseError::Malformed(format!("unknown transfer syntax {transfer_syntax_uid}")))?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts).map_err(|e| crate::error::DimseError::Malformed(e.to_string()))
}

/// Flatten every element of a decoded Identifier dataset into the
/// `Identifier` map handlers consume, skipping elements whose value can't be
/// read as a string (sequences, pixel data).
fn project_identifier(obj: &InMemDicomObject) -> Identifier {
    let mut identifier = Identifier::new();
    for element in obj {
        let tag = element.header().tag;
        if let Ok(s) = element.to_str() {
            identifier.insert(DicomTag(tag.group(), tag.element()), TagValue::String(s.trim_end_matches('\0').to_string()));
        }
    }
    identifier
}

/// Project each item of a sequence element (e.g. ReferencedStudySequence)
/// into its own flattened `Identifier`.
fn extract_reference_sequence(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Vec<Identifier> {
    match obj.element(tag).ok().map(|e| e.value()) {
        Some(dicom_core::DicomValue::Sequence(seq)) => seq.items().iter().map(project_identifier).collect(),
        _ => Vec::new(),
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_c_store_end(
    association: &mut ServerAssociation<TcpStream>,
    presentation_context_id: u8,
    msg_id: u16,
    transfer_syntax_uid: &str,
    instance_bytes: &[u8],
    request_sop_class_uid: &str,
    request_sop_instance_uid: &str,
    handler: &dyn StoreRequestHandler,
) -> Result<(), crate::error::DimseError> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .ok_or_else(|| crate::error::DimseError::Malformed(format!("unknown transfer syntax {transfer_syntax_uid}")))?;

    let obj = InMemDicomObject::read_dataset_with_ts(instance_bytes, ts)
        .map_err(|e| crate::error::DimseError::Malformed(e.to_string()))?;

    let actual_sop_class_uid = read_str(&obj, tags::SOP_CLASS_UID).unwrap_or_default();
    let actual_sop_instance_uid = read_str(&obj, tags::SOP_INSTANCE_UID).unwrap_or_default();

    // spec.md §4.I step 3: verify affected-SOP-class/instance UID equal the
    // transmitted request UIDs.
    if actual_sop_class_uid != request_sop_class_uid || actual_sop_instance_uid != request_sop_instance_uid {
        return send_simple_response(
            association,
            presentation_context_id,
            COMMAND_FIELD_C_STORE_RSP,
            msg_id,
            DimseStatus::ErrorDataSetDoesNotMatchSopClass,
        );
    }

    let summary = summarize(&obj);
    let json = dicom_object_to_json(&obj);

    let status = match handler.handle(
        instance_bytes,
        &summary,
        &json,
        "",
        association.client_ae_title(),
        association.client_ae_title(),
    ) {
        Ok(_) => DimseStatus::Success,
        Err(orthanc_core::OrthancError::InexistentItem(missing)) => {
            tracing::warn!(tag = %missing, "instance missing a required tag, storing anyway");
            DimseStatus::Success
        }
        Err(e) => {
            tracing::warn!(error = %e, "store handler failed");
            crate::status::map_error(&e)
        }
    };

    send_simple_response(association, presentation_context_id, COMMAND_FIELD_C_STORE_RSP, msg_id, status)
}

fn handle_c_find(
    association: &mut ServerAssociation<TcpStream>,
    presentation_context_id: u8,
    msg_id: u16,
    affected_sop_class_uid: &str,
    identifier_obj: &InMemDicomObject,
    handlers: &ScpHandlers,
) -> Result<(), crate::error::DimseError> {
    let mut answers = AnswerSet::default();

    let result = if affected_sop_class_uid == MODALITY_WORKLIST_FIND_SOP_CLASS_UID {
        match handlers.worklist.as_deref() {
            Some(worklist) => {
                let mut query = WorklistQuery {
                    identifier: project_identifier(identifier_obj),
                    referenced_study_sequence: extract_reference_sequence(
                        identifier_obj,
                        tags::REFERENCED_STUDY_SEQUENCE,
                    ),
                    referenced_patient_sequence: extract_reference_sequence(
                        identifier_obj,
                        tags::REFERENCED_PATIENT_SEQUENCE,
                    ),
                };
                fixup_worklist_query(&mut query);
                worklist.handle(&mut answers, &query.identifier, "", "", "")
            }
            None => {
                return send_simple_response(
                    association,
                    presentation_context_id,
                    COMMAND_FIELD_C_FIND_RSP,
                    msg_id,
                    DimseStatus::ErrorCannotUnderstand,
                );
            }
        }
    } else {
        let query = project_identifier(identifier_obj);
        handlers.find.handle(&mut answers, &query, "", "", "")
    };

    if let Err(e) = result {
        tracing::warn!(error = %e, "find handler failed");
        return send_simple_response(
            association,
            presentation_context_id,
            COMMAND_FIELD_C_FIND_RSP,
            msg_id,
            crate::status::map_error(&e),
        );
    }

    let mut state = FindState::new(answers);
    loop {
        let (status, _identifier) = state.next();
        send_simple_response(association, presentation_context_id, COMMAND_FIELD_C_FIND_RSP, msg_id, status)?;
        if status != DimseStatus::Pending {
            return Ok(());
        }
    }
}

/// Drive a C-MOVE request to completion: each sub-operation is an outbound
/// C-STORE the handler's iterator performs against the move destination,
/// one `MoveState::advance()` call per response (spec.md §4.I, scenario 5).
fn handle_c_move(
    association: &mut ServerAssociation<TcpStream>,
    presentation_context_id: u8,
    msg_id: u16,
    move_destination: &str,
    query: &Identifier,
    handler: &dyn MoveRequestHandler,
) -> Result<(), crate::error::DimseError> {
    let iterator = match handler.handle(
        move_destination,
        query,
        "",
        association.client_ae_title(),
        association.client_ae_title(),
        Some(msg_id),
    ) {
        Ok(iterator) => iterator,
        Err(e) => {
            tracing::warn!(error = %e, "move handler failed");
            return send_simple_response(
                association,
                presentation_context_id,
                COMMAND_FIELD_C_MOVE_RSP,
                msg_id,
                crate::status::map_error(&e),
            );
        }
    };

    let mut state = MoveState::new(iterator, Some(msg_id));
    loop {
        let (status, counters) = state.advance();
        send_suboperation_response(
            association,
            presentation_context_id,
            COMMAND_FIELD_C_MOVE_RSP,
            msg_id,
            status,
            counters.remaining,
            counters.completed,
            counters.failed,
            counters.warning,
        )?;
        if status != DimseStatus::Pending {
            return Ok(());
        }
    }
}

/// Drive a C-GET request to completion. Sub-operations are embedded C-STORE
/// exchanges on this same association, performed by the handler's `do_next`
/// (spec.md §4.I); one `GetState::record()` call translates each step into
/// the accumulated response status.
fn handle_c_get(
    association: &mut ServerAssociation<TcpStream>,
    presentation_context_id: u8,
    msg_id: u16,
    query: &Identifier,
    factory: &(dyn Fn() -> Box<dyn GetRequestHandler> + Send + Sync),
) -> Result<(), crate::error::DimseError> {
    let mut handler = factory();
    if let Err(e) = handler.handle(query, "", association.client_ae_title(), association.client_ae_title()) {
        tracing::warn!(error = %e, "get handler failed");
        return send_simple_response(
            association,
            presentation_context_id,
            COMMAND_FIELD_C_GET_RSP,
            msg_id,
            crate::status::map_error(&e),
        );
    }

    let mut state = GetState::new(handler.sub_op_count());
    loop {
        let step = match handler.do_next() {
            Ok(step) => step,
            Err(e) => {
                tracing::warn!(error = %e, "get sub-operation failed");
                GetStepStatus::Failure
            }
        };
        let failed_uid = handler.failed_sop_instance_uids().last().map(|s| s.as_str());
        let (status, counters) = state.record(step, failed_uid);
        send_suboperation_response(
            association,
            presentation_context_id,
            COMMAND_FIELD_C_GET_RSP,
            msg_id,
            status,
            counters.remaining,
            counters.completed,
            counters.failed,
            counters.warning,
        )?;
        if status != DimseStatus::Pending {
            return Ok(());
        }
    }
}

/// Project the main-tags summary out of a just-decoded instance — the
/// `Identifier` handed to `StoreRequestHandler::handle`.
fn summarize(obj: &InMemDicomObject) -> Identifier {
    const SUMMARY_TAGS: &[(DicomTag, dicom_core::Tag)] = &[
        (DicomTag(0x0010, 0x0020), tags::PATIENT_ID),
        (DicomTag(0x0020, 0x000D), tags::STUDY_INSTANCE_UID),
        (DicomTag(0x0020, 0x000E), tags::SERIES_INSTANCE_UID),
        (DicomTag(0x0008, 0x0018), tags::SOP_INSTANCE_UID),
        (DicomTag(0x0008, 0x0016), tags::SOP_CLASS_UID),
    ];
    let mut summary = HashMap::new();
    for (dicom_tag, core_tag) in SUMMARY_TAGS {
        if let Some(value) = read_str(obj, *core_tag) {
            summary.insert(*dicom_tag, TagValue::String(value));
        }
    }
    summary
}

/// Project a decoded instance into the flattened tag -> value JSON object
/// Orthanc caches as the `DicomAsJson` attachment (spec.md §6), keyed by
/// `"GGGGEEEE"` hex tag.
fn dicom_object_to_json(obj: &InMemDicomObject) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (tag, value) in project_identifier(obj) {
        if let TagValue::String(s) = value {
            map.insert(format!("{:04X}{:04X}", tag.0, tag.1), serde_json::Value::String(s));
        }
    }
    serde_json::Value::Object(map)
}

fn send_simple_response(
    association: &mut ServerAssociation<TcpStream>,
    presentation_context_id: u8,
    command_field: u16,
    message_id: u16,
    status: DimseStatus,
) -> Result<(), crate::error::DimseError> {
    let mut obj = InMemDicomObject::<StandardDataDictionary>::new_empty();
    obj.put(DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(command_field)));
    obj.put(DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(message_id)));
    obj.put(DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(0x0101u16)));
    obj.put(DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status.code())));

    send_command(association, presentation_context_id, obj)
}

/// Same as `send_simple_response` but with the four sub-operation counter
/// elements C-MOVE-RSP/C-GET-RSP carry (spec.md §4.I).
#[allow(clippy::too_many_arguments)]
fn send_suboperation_response(
    association: &mut ServerAssociation<TcpStream>,
    presentation_context_id: u8,
    command_field: u16,
    message_id: u16,
    status: DimseStatus,
    remaining: usize,
    completed: usize,
    failed: usize,
    warning: usize,
) -> Result<(), crate::error::DimseError> {
    let mut obj = InMemDicomObject::<StandardDataDictionary>::new_empty();
    obj.put(DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(command_field)));
    obj.put(DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(message_id)));
    obj.put(DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(0x0101u16)));
    obj.put(DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status.code())));
    obj.put(DataElement::new(
        tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
        VR::US,
        PrimitiveValue::from(remaining as u16),
    ));
    obj.put(DataElement::new(
        tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
        VR::US,
        PrimitiveValue::from(completed as u16),
    ));
    obj.put(DataElement::new(
        tags::NUMBER_OF_FAILED_SUBOPERATIONS,
        VR::US,
        PrimitiveValue::from(failed as u16),
    ));
    obj.put(DataElement::new(
        tags::NUMBER_OF_WARNING_SUBOPERATIONS,
        VR::US,
        PrimitiveValue::from(warning as u16),
    ));

    send_command(association, presentation_context_id, obj)
}

fn send_command(
    association: &mut ServerAssociation<TcpStream>,
    presentation_context_id: u8,
    obj: InMemDicomObject<StandardDataDictionary>,
) -> Result<(), crate::error::DimseError> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut bytes = Vec::new();
    obj.write_dataset_with_ts(&mut bytes, &ts)
        .map_err(|e| crate::error::DimseError::Malformed(e.to_string()))?;

    let pdu = Pdu::PData {
        data: vec![dicom_ul::pdu::PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: bytes,
        }],
    };
    association.send(&pdu).map_err(crate::error::DimseError::from)
}
