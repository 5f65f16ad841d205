//! Query parameters.
//!
//! Positional parameters passed as `&[&(dyn ToSql + Sync)]` are named `@p1`, `@p2`,
//! ... in order, matching the placeholders in the SQL text. Procedure calls
//! take [`NamedParam`]s, which may be marked as output parameters.

use mssql_types::{ParamContext, SqlValue, ToSql, TypeError, encode_param};
use tds_protocol::RpcParam;

use crate::error::{Error, Result};

/// A named parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedParam {
    /// Parameter name; a leading `@` is added when missing.
    pub name: String,
    /// Parameter value.
    pub value: SqlValue,
    /// Whether the server should send the value back.
    pub output: bool,
}

impl NamedParam {
    /// Input parameter.
    pub fn new(name: impl Into<String>, value: SqlValue) -> Self {
        Self {
            name: name.into(),
            value,
            output: false,
        }
    }

    /// Input parameter from any [`ToSql`] value.
    ///
    /// A `None` keeps the type of the wrapped value, so the server sees a
    /// typed NULL.
    pub fn from_value<T: ToSql>(
        name: impl Into<String>,
        value: &T,
    ) -> std::result::Result<Self, TypeError> {
        Ok(Self::new(name, value.to_sql()?))
    }

    /// Mark as an output parameter. The value is the initial value; a typed
    /// NULL declares the output type.
    #[must_use]
    pub fn output(mut self) -> Self {
        self.output = true;
        self
    }

    fn wire_name(&self) -> String {
        if self.name.starts_with('@') {
            self.name.clone()
        } else {
            format!("@{}", self.name)
        }
    }
}

/// Types that turn themselves into named parameters.
///
/// ```rust,ignore
/// struct NewUser { name: String, email: Option<String> }
///
/// impl ToParams for NewUser {
///     fn to_params(&self) -> Result<Vec<NamedParam>, TypeError> {
///         Ok(vec![
///             NamedParam::from_value("name", &self.name)?,
///             NamedParam::from_value("email", &self.email)?,
///         ])
///     }
/// }
/// ```
pub trait ToParams {
    /// Convert to named parameters.
    fn to_params(&self) -> std::result::Result<Vec<NamedParam>, TypeError>;
}

impl ToParams for [NamedParam] {
    fn to_params(&self) -> std::result::Result<Vec<NamedParam>, TypeError> {
        Ok(self.to_vec())
    }
}

impl ToParams for Vec<NamedParam> {
    fn to_params(&self) -> std::result::Result<Vec<NamedParam>, TypeError> {
        Ok(self.clone())
    }
}

/// Encode positional parameters as `@p1..@pN`.
pub(crate) fn positional(params: &[&(dyn ToSql + Sync)], ctx: &ParamContext) -> Result<Vec<RpcParam>> {
    params
        .iter()
        .enumerate()
        .map(|(i, param)| {
            let name = format!("@p{}", i + 1);
            let value = param.to_sql().map_err(|source| Error::Parameter {
                name: name.clone(),
                source,
            })?;
            encode_one(name, &value, false, ctx)
        })
        .collect()
}

/// Encode named parameters, keeping their order.
pub(crate) fn named(params: &[NamedParam], ctx: &ParamContext) -> Result<Vec<RpcParam>> {
    params
        .iter()
        .map(|p| encode_one(p.wire_name(), &p.value, p.output, ctx))
        .collect()
}

fn encode_one(
    name: String,
    value: &SqlValue,
    output: bool,
    ctx: &ParamContext,
) -> Result<RpcParam> {
    match encode_param(value, ctx) {
        Ok(encoded) => {
            let param = encoded.into_rpc_param(name);
            Ok(if output { param.as_output() } else { param })
        }
        Err(source) => Err(Error::Parameter { name, source }),
    }
}
