//! Virtual columns: expression-computed columns resolved per row.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use basalt_core::{BasaltError, Result, Scalar, ValueDesc};
use basalt_expr::{Expr, NumericBinding};

use crate::cursor::RowReader;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VirtualColumnSpec {
    #[serde(rename = "expr")]
    Expr {
        name: String,
        expression: String,
        #[serde(rename = "outputType", default)]
        output_type: Option<ValueDesc>,
    },
}

impl VirtualColumnSpec {
    pub fn name(&self) -> &str {
        match self {
            VirtualColumnSpec::Expr { name, .. } => name,
        }
    }
}

/// Compiled virtual column set for one scan.
#[derive(Default)]
pub struct VirtualColumns {
    columns: HashMap<String, CompiledVirtual>,
}

struct CompiledVirtual {
    expr: Expr,
    output_type: Option<ValueDesc>,
}

impl VirtualColumns {
    pub fn empty() -> VirtualColumns {
        VirtualColumns::default()
    }

    pub fn compile(specs: &[VirtualColumnSpec]) -> Result<VirtualColumns> {
        let mut columns = HashMap::new();
        for spec in specs {
            match spec {
                VirtualColumnSpec::Expr {
                    name,
                    expression,
                    output_type,
                } => {
                    let expr = basalt_expr::parse(expression)?;
                    columns.insert(
                        name.clone(),
                        CompiledVirtual {
                            expr,
                            output_type: output_type.clone(),
                        },
                    );
                }
            }
        }
        Ok(VirtualColumns { columns })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn output_type(&self, name: &str) -> Option<ValueDesc> {
        self.columns.get(name).and_then(|c| {
            c.output_type
                .clone()
                .or(Some(ValueDesc::String))
        })
    }

    /// Resolve a name against base columns first, then virtual definitions.
    /// Virtual expressions see base columns and other virtual columns;
    /// unknown names inside an expression read as null.
    pub fn resolve(&self, reader: &dyn RowReader, name: &str) -> Result<Scalar> {
        if reader.has_column(name) {
            return Ok(reader.scalar(name));
        }
        let Some(compiled) = self.columns.get(name) else {
            return Err(BasaltError::IllegalArgument(format!(
                "unknown column: {name}"
            )));
        };
        let binding = VirtualBinding {
            virtuals: self,
            reader,
        };
        compiled.expr.eval(&binding)
    }
}

struct VirtualBinding<'a> {
    virtuals: &'a VirtualColumns,
    reader: &'a dyn RowReader,
}

impl NumericBinding for VirtualBinding<'_> {
    fn get(&self, name: &str) -> Scalar {
        if self.reader.has_column(name) {
            return self.reader.scalar(name);
        }
        self.virtuals
            .columns
            .get(name)
            .and_then(|c| c.expr.eval(self).ok())
            .unwrap_or(Scalar::Null)
    }
}
