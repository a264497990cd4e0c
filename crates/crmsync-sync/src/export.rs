//! CRM object and property-definition exports to CSV.

use std::path::Path;

use anyhow::Context;
use crmsync_adapters::{CrmClient, CrmRecord};
use crmsync_core::ObjectType;
use crmsync_storage::write_csv_file;
use serde::Serialize;
use tracing::info;

pub const EXPORT_PAGE_LIMIT: usize = 100;

pub const PROPERTY_HEADER: [&str; 6] = [
    "name",
    "label",
    "type",
    "field_type",
    "group_name",
    "description",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub object_type: String,
    pub pages: usize,
    pub records: usize,
    pub output: String,
}

fn record_row(record: &CrmRecord, properties: &[String]) -> Vec<String> {
    std::iter::once(record.id.clone())
        .chain(properties.iter().map(|name| {
            record
                .properties
                .get(name)
                .cloned()
                .flatten()
                .unwrap_or_default()
        }))
        .collect()
}

/// Page through every record of `object_type` and write `id` plus `properties` columns.
pub async fn export_records(
    crm: &dyn CrmClient,
    object_type: &ObjectType,
    properties: &[String],
    output: &Path,
) -> anyhow::Result<ExportSummary> {
    let mut rows = Vec::new();
    let mut after: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = crm
            .list_records(object_type, properties, after.as_deref(), EXPORT_PAGE_LIMIT)
            .await
            .with_context(|| format!("listing {object_type} after {after:?}"))?;
        pages += 1;
        rows.extend(page.records.iter().map(|r| record_row(r, properties)));
        info!(%object_type, pages, records = rows.len(), "export page fetched");

        match page.next_after {
            Some(next) if !page.records.is_empty() => after = Some(next),
            _ => break,
        }
    }

    let header = std::iter::once("id".to_string())
        .chain(properties.iter().cloned())
        .collect::<Vec<_>>();
    let records = write_csv_file(output, &header, rows).await?;

    Ok(ExportSummary {
        object_type: object_type.to_string(),
        pages,
        records,
        output: output.display().to_string(),
    })
}

/// Write the property definitions of `object_type`, sorted by name.
pub async fn export_properties(
    crm: &dyn CrmClient,
    object_type: &ObjectType,
    output: &Path,
) -> anyhow::Result<usize> {
    let mut definitions = crm
        .list_properties(object_type)
        .await
        .with_context(|| format!("listing {object_type} properties"))?;
    definitions.sort_by(|a, b| a.name.cmp(&b.name));

    let rows = definitions.into_iter().map(|d| {
        vec![
            d.name,
            d.label,
            d.property_type,
            d.field_type,
            d.group_name,
            d.description,
        ]
    });
    write_csv_file(output, &PROPERTY_HEADER, rows).await
}
