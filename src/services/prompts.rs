use serde_json::{json, Value};

use crate::error::AppError;
use crate::models::{DataFormat, FileData, NamedDataset, SchemaModel};
use crate::services::comparator::{AggregationGroup, GroupComparison};

pub const SCHEMA_SYSTEM: &str =
    "You are a data analysis assistant that generates detailed schema information from tabular data.";

pub const DBT_SYSTEM: &str =
    "You are a DBT expert that generates high-quality DBT rules and tests based on schema information.";

pub const CONVERSION_SYSTEM: &str = "You are a Python expert specializing in data conversion scripts. Generate clean, efficient, and well-documented Python code.";

const CONVERSION_REQUIREMENTS: &str = r##"Please generate two Python scripts:
1. **convert_to_source.py** - Converts uploaded file to the source format
2. **convert_to_destination.py** - Converts from source to destination format

Requirements:
- Use uv-style inline script requirements at the top of each file in this format:
  # /// script
  # requires-python = '>=3.12'
  # dependencies = ['pandas>=2.0.0', 'numpy>=1.24.0', 'other-package>=version', 'openpyxl>=3.1.5' ]
  # ///
- Always add all the dependencies to the script (inline).
- For Excel files, automatically handle multiple sheets using sheet names as table names
- DO NOT require a --table parameter; automatically process all sheets in Excel files
- Use argparse with only the input file as a required positional argument
- For single-sheet files (CSV, JSON, etc.), use the filename (without extension) as the table name
- Include proper error handling and logging
- Add data validation where appropriate
- Handle different file encodings
- Add clear documentation and usage examples
- Strictly follow the source and destination formats
- Consider PII data handling for sensitive columns
- Optimize for performance with large datasets
- Include progress indicators for large files
- Use modern Python features and type hints
- Make scripts runnable with: uv run script.py

Return the response as JSON with this structure:
{
  "sourceScript": "# /// script\n# requires-python = '>=3.12'\n# dependencies = ['pandas>=2.0.0', 'numpy>=1.24.0']\n# ///\n\n# Python code for convert_to_source.py...",
  "destScript": "# /// script\n# requires-python = '>=3.12'\n# dependencies = ['pandas>=2.0.0', 'numpy>=1.24.0']\n# ///\n\n# Python code for convert_to_destination.py...",
  "usage": {
    "sourceScript": "uv run convert_to_source.py input_file.ext",
    "destScript": "uv run convert_to_destination.py source_file.ext output_file.ext"
  }
}"##;

/// Placeholders: `${fileData.name}`, `${fileData.type}`, `${fileData.sheets}`,
/// `${globalTableRules}`.
pub const DEFAULT_SCHEMA_PROMPT: &str = r#"Analyze the following tabular data and infer a relational schema for it.

File: ${fileData.name}
Type: ${fileData.type}
${fileData.sheets}
${globalTableRules}
Treat each sheet as a table. For every table determine its type (fact, dimension, bridge, staging, lookup), a
business description, its primary key and every column's data type, meaning, key flags, PII status, data
classification, constraints and data quality observations. Then detect relationships between tables, suggest
useful join patterns and give data modeling recommendations.

Return ONLY a JSON object with this structure:
{
  "schemas": [
    {
      "tableName": "string",
      "tableType": "fact|dimension|bridge|staging|lookup",
      "description": "string",
      "primaryKey": {"columns": ["string"], "type": "natural|surrogate|composite", "confidence": "high|medium|low"},
      "columns": [
        {
          "name": "string",
          "dataType": "string",
          "description": "string",
          "isPrimaryKey": false,
          "isForeignKey": false,
          "isPII": false,
          "dataClassification": "public|internal|confidential|restricted",
          "foreignKeyReference": {"referencedTable": "string", "referencedColumn": "string", "confidence": "high|medium|low"},
          "constraints": ["string"],
          "qualityObservations": ["string"]
        }
      ]
    }
  ],
  "relationships": [
    {
      "fromTable": "string", "fromColumn": "string", "toTable": "string", "toColumn": "string",
      "relationshipType": "one-to-one|one-to-many|many-to-many",
      "joinType": "inner|left|right|full",
      "confidence": "high|medium|low",
      "description": "string"
    }
  ],
  "suggestedJoins": [
    {"description": "string", "useCase": "string", "tables": ["string"], "sqlPattern": "string"}
  ],
  "modelingRecommendations": ["string"]
}"#;

/// Placeholder: `${schemaData}`.
pub const DEFAULT_DBT_RULES_PROMPT: &str = r#"Generate DBT models and tests for the schema below.

Schema:
${schemaData}

For every table produce a DBT model: the model SQL, the schema.yml configuration, a materialization strategy,
column tests (unique, not_null, accepted_values, relationships and custom tests where they make sense),
relationships to other models with their join logic, and model-specific recommendations. Finish with global
project recommendations and a short summary of the generated rules.

Return ONLY a JSON object with this structure:
{
  "dbtRules": [
    {
      "tableName": "string",
      "modelSql": "string",
      "yamlConfig": "string",
      "materialization": "table|view|incremental|ephemeral",
      "tests": [
        {
          "column": "string",
          "tests": ["unique", "not_null", {"accepted_values": {"values": ["a", "b"]}}],
          "relationships": [{"test": "relationships", "to": "ref('model')", "field": "string"}]
        }
      ],
      "relationships": [{"description": "string", "joinLogic": "string"}],
      "recommendations": ["string"]
    }
  ],
  "globalRecommendations": ["string"],
  "summary": "string"
}"#;

/// Placeholder: `${context}`.
const DBT_CHAT_SYSTEM: &str = r#"You are a DBT expert helping a user refine the DBT rules generated for their data.

Current context (file summary, schema, DBT rules and any attached file):
${context}

Answer questions about the rules in plain markdown. When the user asks you to change, add or remove rules,
explain the change briefly and then write the marker DBT_RULE_JSON: followed by exactly one JSON object:

DBT_RULE_JSON: {
  "dbtRules": [
    {"tableName": "existing_or_new_table", "isNewRule": false, "modelSql": "...", "yamlConfig": "...",
     "materialization": "...", "tests": [...], "relationships": [...], "recommendations": [...]}
  ],
  "globalRecommendations": ["..."],
  "summary": "..."
}

Rules for the JSON object:
- Include only the rules that change. Fields you include replace the existing values; omitted fields are kept.
- Use the exact tableName of an existing rule to modify it.
- Set "isNewRule": true to add a rule, even if a rule for that table already exists.
- Include "globalRecommendations" or "summary" only when they change.
- Write nothing after the JSON object."#;

const GENERAL_CHAT_SYSTEM: &str = "You are a helpful assistant specializing in data analysis, schema design, and DBT rules. Answer questions about the uploaded data file, schema, or DBT rules.";

pub const COLUMN_MAPPING_SYSTEM: &str = r#"You are a data analyst expert. Analyze two datasets and create column mappings between them.
Your task:
1. Identify which columns from Dataset A correspond to columns in Dataset B (even if names are different).
2. Provide common names for mapped columns
3. **Very IMPORTANT: datatypes must be same for both the mapping columns.**
4. Identify column data types and context
5. **IMPORTANT: Identify date columns - these often appear as Excel serial numbers (like 45932, 45898) or date strings**
6. Suggest which columns are suitable for SUM aggregation and COUNT aggregation

**Date Detection Rules:**
- Numbers like 45932, 45898, 44927 are Excel date serial numbers
- Column names containing "date", "time", "created", "updated" are likely dates
- Values that look like dates (YYYY-MM-DD, MM/DD/YYYY) are dates

Return ONLY a valid JSON object with this exact structure:
{
  "mappings": [
    {
      "dataset1_column": "column_name_from_dataset1",
      "dataset2_column": "column_name_from_dataset2",
      "common_name": "unified_column_name",
      "data_type": "string|number|date|boolean",
      "description": "what this column represents",
      "suitable_for_sum": false,
      "suitable_for_count": true,
      "is_excel_date_serial": true
    }
  ],
  "dataset1_only": ["column1", "column2"],
  "dataset2_only": ["column3", "column4"],
  "suggested_grouping_columns": ["common_name1", "common_name2"],
  "suggested_sum_columns": ["common_name3"],
  "suggested_count_columns": ["common_name1", "common_name4"],
  "date_columns": {
    "dataset1": ["column_name"],
    "dataset2": ["column_name"],
    "mapped": ["common_name"]
  }
}"#;

const MISMATCH_SYSTEM: &str = r#"You are a data analyst expert. Analyze the differences between two datasets for a specific group and explain why there are discrepancies.
Provide a clear, concise analysis in 2-3 sentences explaining:
1. What specific differences you observe
2. Possible reasons for the discrepancies
3. Recommendations for investigation
Focus on data quality issues, missing records, calculation differences, or data processing problems."#;

const MATCH_SYSTEM: &str = r#"You are a data analyst expert. Analyze two datasets for a specific group that show matching aggregated values.
Provide a clear, concise summary in 2-3 sentences explaining:
1. What data consistency you observe
2. What this matching data indicates about data quality
3. Any insights about the data patterns
Focus on data quality validation and consistency indicators."#;

/// Rows shown to the LLM when it proposes a column mapping.
pub const MAPPING_SAMPLE_ROWS: usize = 10;
/// Rows per side included in a group narration.
pub const NARRATION_SAMPLE_ROWS: usize = 5;
/// Sample rows per sheet embedded in the schema prompt.
pub const SCHEMA_SAMPLE_ROWS: usize = 5;

fn tsv_cell(value: &Value) -> String {
    let text = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.replace(['\t', '\n'], " ")
}

fn sheets_section(file: &FileData) -> String {
    file.sheets
        .iter()
        .map(|sheet| {
            let rows = &sheet.sample_rows[..sheet.sample_rows.len().min(SCHEMA_SAMPLE_ROWS)];
            let tsv = rows
                .iter()
                .map(|row| row.iter().map(tsv_cell).collect::<Vec<_>>().join("\t"))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "\nSheet: {}\nHeaders: {}\nSample Data ({} rows):\n{}",
                sheet.name,
                sheet.headers.join("\t"),
                rows.len(),
                tsv
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn schema_prompt(template: &str, file: &FileData, global_table_rules: &str) -> String {
    let rules = if global_table_rules.trim().is_empty() {
        String::new()
    } else {
        format!("\n\nGLOBAL TABLE CLASSIFICATION RULES:\n{}\n", global_table_rules)
    };
    template
        .replace("${fileData.name}", &file.name)
        .replace("${fileData.type}", &file.file_type)
        .replace("${fileData.sheets}", &sheets_section(file))
        .replace("${globalTableRules}", &rules)
}

pub fn dbt_rules_prompt(template: &str, schema: &SchemaModel) -> Result<String, AppError> {
    Ok(template.replace("${schemaData}", &serde_json::to_string(schema)?))
}

/// Only names, types and PII flags of the schema's columns are sent, plus the
/// relationships.
pub fn conversion_prompt(
    schema: &SchemaModel,
    source: DataFormat,
    dest: DataFormat,
    parameters: Option<&str>,
) -> Result<String, AppError> {
    let tables: Vec<Value> = schema
        .schemas
        .iter()
        .flatten()
        .map(|table| {
            let columns: Vec<Value> = table
                .columns
                .iter()
                .flatten()
                .map(|col| json!({ "name": col.name, "dataType": col.data_type, "isPII": col.is_pii }))
                .collect();
            json!({ "tableName": table.table_name, "columns": columns })
        })
        .collect();
    let relationships = schema.relationships.clone().unwrap_or_default();
    let parameters = parameters.map(str::trim).filter(|p| !p.is_empty());

    Ok(format!(
        "Generate Python conversion scripts for data ingestion with the following requirements:\n\n\
         **Source Format**: {}\n\
         **Destination Format**: {}\n\
         **Additional Parameters**: {}\n\n\
         **Schema Information**:\n{}\n\n\
         **Relationships**:\n{}\n\n{}",
        source,
        dest,
        parameters.unwrap_or("None specified"),
        serde_json::to_string_pretty(&tables)?,
        serde_json::to_string_pretty(&relationships)?,
        CONVERSION_REQUIREMENTS
    ))
}

pub fn dbt_chat_system(context: &Value) -> String {
    DBT_CHAT_SYSTEM.replace("${context}", &context.to_string())
}

/// System message for chat turns that do not touch rules. `attached` is a
/// file sent with this message; `context` the session's file, schema and rules.
pub fn general_chat_system(attached: Option<&FileData>, context: Option<&Value>) -> Result<String, AppError> {
    let mut parts = vec![GENERAL_CHAT_SYSTEM.to_string()];
    if let Some(file) = attached {
        parts.push(format!(
            "The user has attached a new file: {}. Here's the data: {}.",
            file.name,
            serde_json::to_string(file)?
        ));
    }
    if let Some(context) = context {
        parts.push(format!(
            "Here's information about the existing data context: {}.",
            context
        ));
    }
    Ok(parts.join(" "))
}

fn dataset_section(label: &str, dataset: &NamedDataset) -> Result<String, AppError> {
    Ok(format!(
        "Dataset {} ({}):\nColumns: {}\nSample Data:\n{}",
        label,
        dataset.name,
        dataset.columns().join(", "),
        serde_json::to_string_pretty(dataset.sample(MAPPING_SAMPLE_ROWS))?
    ))
}

pub fn column_mapping_user(first: &NamedDataset, second: &NamedDataset) -> Result<String, AppError> {
    Ok(format!(
        "{}\n\n{}\n\nCreate column mappings and analysis. Pay special attention to identifying date columns that may appear as Excel serial numbers.",
        dataset_section("A", first)?,
        dataset_section("B", second)?
    ))
}

pub fn discrepancy_system(has_mismatch: bool) -> &'static str {
    if has_mismatch {
        MISMATCH_SYSTEM
    } else {
        MATCH_SYSTEM
    }
}

pub fn discrepancy_user(names: (&str, &str), comparison: &GroupComparison) -> String {
    let side = |index: usize, name: &str, group: &AggregationGroup| {
        let sample = &group.source_rows[..group.source_rows.len().min(NARRATION_SAMPLE_ROWS)];
        format!(
            "Dataset {} ({}) - {} rows:\nSum Values: {}\nCount Values: {}\nSample Data: {}",
            index,
            name,
            group.source_rows.len(),
            serde_json::to_string(&group.sums).unwrap_or_default(),
            serde_json::to_string(&group.counts).unwrap_or_default(),
            serde_json::to_string_pretty(sample).unwrap_or_default()
        )
    };
    let ask = if comparison.has_mismatch {
        "Analyze why these datasets show different aggregated values for this group."
    } else {
        "Analyze the consistency and patterns in these matching datasets for this group."
    };
    format!(
        "Group: {}\n{}\n\n{}\n\n{}",
        comparison.group_key,
        side(1, names.0, &comparison.first),
        side(2, names.1, &comparison.second),
        ask
    )
}
