//! Postgres metadata index, one module per schema version that changed
//! the storage layout.
//!
//! * V5: base layout (`workitem`, `workitem_tag_value`, `workitem_query_tag`).
//! * V6: no operation changes; declared so a V6 database resolves to V6.
//! * V7: `workitem.watermark`, bumped and checked by every state or tag
//!   write.

mod v5;
mod v7;

use sqlx::PgPool;

use crate::model::SchemaVersion;
use crate::versioning::{IndexOperationSet, OperationSignature, OperationTable, Parameter};

/// Every schema version this binary can talk to.
pub fn sql_operation_table() -> OperationTable<PgPool> {
    OperationTable::new()
        .declare(SchemaVersion::V5, v5::operations())
        .declare(SchemaVersion::V6, IndexOperationSet::inherit_all())
        .declare(SchemaVersion::V7, v7::operations())
}

/// The parameter lists the index operations accept at `version`.
pub fn operation_signatures(version: SchemaVersion) -> Vec<OperationSignature> {
    let identity = || {
        vec![
            Parameter::required("partition_key", "integer"),
            Parameter::required("workitem_uid", "text"),
        ]
    };
    let mut update_state = vec![
        Parameter::required("workitem_key", "bigint"),
        Parameter::required("partition_key", "integer"),
        Parameter::required("expected_state", "text"),
        Parameter::required("expected_transaction_uid", "text"),
        Parameter::required("new_state", "text"),
        Parameter::required("new_transaction_uid", "text"),
    ];
    let mut update_tags = vec![
        Parameter::required("workitem_key", "bigint"),
        Parameter::required("partition_key", "integer"),
        Parameter::required("expected_state", "text"),
        Parameter::required("expected_transaction_uid", "text"),
        Parameter::required("tags", "text[]"),
        Parameter::required("tag_values", "text[]"),
    ];
    if version >= SchemaVersion::V7 {
        update_state.push(Parameter::defaulted("expected_watermark", "bigint"));
        update_tags.push(Parameter::defaulted("expected_watermark", "bigint"));
    }

    vec![
        OperationSignature {
            name: "add_entry",
            parameters: [
                identity(),
                vec![
                    Parameter::required("state", "text"),
                    Parameter::required("tags", "text[]"),
                    Parameter::required("tag_values", "text[]"),
                ],
            ]
            .concat(),
        },
        OperationSignature {
            name: "get_entry",
            parameters: identity(),
        },
        OperationSignature {
            name: "delete_entry",
            parameters: identity(),
        },
        OperationSignature {
            name: "update_state",
            parameters: update_state,
        },
        OperationSignature {
            name: "update_tags",
            parameters: update_tags,
        },
        OperationSignature {
            name: "get_query_tags",
            parameters: Vec::new(),
        },
    ]
}
