//! Template rendering for generated SQL and manifests
//!
//! Uses minijinja with:
//! - Variable delimiters: `${...}`
//! - Block delimiters: `{%...%}`
//! - Comment delimiters: `{#...#}`
//!
//! Undefined variables are an error, never an empty string.

use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};
use serde::Serialize;

use crate::Result;

/// Renders `${...}` templates with strict undefined handling
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    pub fn new() -> Result<Self> {
        let syntax = SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .block_delimiters("{%", "%}")
            .comment_delimiters("{#", "#}")
            .build()?;

        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("upper", upper);
        env.add_filter("lower", lower);
        env.add_filter("required", required);
        env.add_filter("sql_str", sql_str);

        Ok(Self { env })
    }

    /// Register a named template from static source (usually `include_str!`).
    pub fn with_template(mut self, name: &'static str, source: &'static str) -> Result<Self> {
        self.env.add_template(name, source)?;
        Ok(self)
    }

    /// Render an ad hoc template string.
    pub fn render<S: Serialize>(&self, template: &str, vars: S) -> Result<String> {
        Ok(self.env.render_str(template, Value::from_serialize(&vars))?)
    }

    /// Render a template registered with [`with_template`](Self::with_template).
    pub fn render_named<S: Serialize>(&self, name: &str, vars: S) -> Result<String> {
        let tmpl = self.env.get_template(name)?;
        Ok(tmpl.render(Value::from_serialize(&vars))?)
    }
}

fn upper(value: &str) -> String {
    value.to_uppercase()
}

fn lower(value: &str) -> String {
    value.to_lowercase()
}

fn required(value: Value) -> std::result::Result<Value, minijinja::Error> {
    if value.is_undefined() || value.is_none() {
        Err(minijinja::Error::new(
            ErrorKind::UndefinedError,
            "required value is undefined",
        ))
    } else {
        Ok(value)
    }
}

/// Single-quoted SQL string literal
fn sql_str(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_dollar_brace_variables() {
        let engine = TemplateEngine::new().unwrap();
        let out = engine
            .render(
                "USE ROLE ${role};\nCREATE DATABASE IF NOT EXISTS ${db};",
                vars(&[("role", "SA"), ("db", "KAMESH_DEV_POLARDB")]),
            )
            .unwrap();
        assert_eq!(out, "USE ROLE SA;\nCREATE DATABASE IF NOT EXISTS KAMESH_DEV_POLARDB;");
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let engine = TemplateEngine::new().unwrap();
        assert!(engine.render("DROP TABLE ${table}", vars(&[])).is_err());
    }

    #[test]
    fn sql_str_escapes_quotes() {
        let engine = TemplateEngine::new().unwrap();
        let out = engine
            .render("${path | sql_str}", vars(&[("path", "o'brien/v1.metadata.json")]))
            .unwrap();
        assert_eq!(out, "'o''brien/v1.metadata.json'");
    }

    #[test]
    fn named_templates_render() {
        let engine = TemplateEngine::new()
            .unwrap()
            .with_template("drop.sql", "DROP ICEBERG TABLE IF EXISTS ${name | upper};")
            .unwrap();
        let out = engine
            .render_named("drop.sql", vars(&[("name", "wildlife_penguins")]))
            .unwrap();
        assert_eq!(out, "DROP ICEBERG TABLE IF EXISTS WILDLIFE_PENGUINS;");
    }
}
