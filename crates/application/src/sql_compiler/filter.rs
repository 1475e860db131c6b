use tessera_domain::{FilterOperator, RelationQuantifier};

use super::*;
use crate::query_plan::{BoundFilter, BoundValue, RelatedCondition, RelatedLink, UserAttribute};

impl SqlBuilder<'_> {
    /// Renders a bound filter as a boolean expression over `alias`.
    pub(super) fn filter(&mut self, filter: &BoundFilter, alias: &str) -> AppResult<String> {
        match filter {
            BoundFilter::And(children) if children.is_empty() => Ok("1 = 1".to_owned()),
            BoundFilter::Or(children) if children.is_empty() => Ok("1 = 0".to_owned()),
            BoundFilter::And(children) => self.junction(children, alias, " AND "),
            BoundFilter::Or(children) => self.junction(children, alias, " OR "),
            BoundFilter::Never => Ok("1 = 0".to_owned()),
            BoundFilter::Compare {
                field,
                kind,
                operator,
                value,
            } => {
                let column = self.column(alias, field);
                match value {
                    BoundValue::Literal(literal) => {
                        self.compare_literal(&column, *kind, *operator, literal)
                    }
                    BoundValue::UserAttribute(attribute) => {
                        self.compare_user_attribute(&column, *operator, attribute)
                    }
                }
            }
            BoundFilter::Related(condition) => self.related(condition, alias),
        }
    }

    fn junction(
        &mut self,
        children: &[BoundFilter],
        alias: &str,
        separator: &str,
    ) -> AppResult<String> {
        let parts = children
            .iter()
            .map(|child| self.filter(child, alias))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(format!("({})", parts.join(separator)))
    }

    fn compare_literal(
        &mut self,
        column: &str,
        kind: ColumnKind,
        operator: FilterOperator,
        literal: &Value,
    ) -> AppResult<String> {
        let sql = match operator {
            FilterOperator::Eq if literal.is_null() => format!("{column} IS NULL"),
            FilterOperator::Neq if literal.is_null() => format!("{column} IS NOT NULL"),
            FilterOperator::Eq
            | FilterOperator::Neq
            | FilterOperator::Lt
            | FilterOperator::Lte
            | FilterOperator::Gt
            | FilterOperator::Gte => {
                let placeholder = self.bind_literal(literal, kind);
                format!("{column} {} {placeholder}", comparison_symbol(operator))
            }
            FilterOperator::In | FilterOperator::Nin => {
                let items = literal
                    .as_array()
                    .ok_or_else(|| invalid_operand(operator.as_str()))?
                    .iter()
                    .filter(|item| !item.is_null())
                    .collect::<Vec<_>>();
                let negated = operator == FilterOperator::Nin;
                if items.is_empty() {
                    return Ok(if negated { "1 = 1" } else { "1 = 0" }.to_owned());
                }
                let placeholders = items
                    .into_iter()
                    .map(|item| self.bind_literal(item, kind))
                    .collect::<Vec<_>>()
                    .join(", ");
                let keyword = if negated { "NOT IN" } else { "IN" };
                format!("{column} {keyword} ({placeholders})")
            }
            FilterOperator::Null | FilterOperator::Nnull => {
                let wanted = literal.as_bool().unwrap_or(true);
                if wanted == (operator == FilterOperator::Null) {
                    format!("{column} IS NULL")
                } else {
                    format!("{column} IS NOT NULL")
                }
            }
            FilterOperator::Contains | FilterOperator::Ncontains => {
                let pattern = format!("%{}%", escape_like(&literal_text(literal)));
                self.like(column, pattern, operator == FilterOperator::Ncontains)
            }
            FilterOperator::Icontains => {
                let pattern = format!("%{}%", escape_like(&literal_text(literal)));
                let placeholder = self.bind(SqlValue::Text(pattern), Some(ColumnKind::Text));
                self.dialect.case_insensitive_like(column, &placeholder)
            }
            FilterOperator::StartsWith | FilterOperator::NstartsWith => {
                let pattern = format!("{}%", escape_like(&literal_text(literal)));
                self.like(column, pattern, operator == FilterOperator::NstartsWith)
            }
            FilterOperator::EndsWith | FilterOperator::NendsWith => {
                let pattern = format!("%{}", escape_like(&literal_text(literal)));
                self.like(column, pattern, operator == FilterOperator::NendsWith)
            }
            FilterOperator::Between | FilterOperator::Nbetween => {
                let Some([low, high]) = literal.as_array().map(Vec::as_slice) else {
                    return Err(invalid_operand(operator.as_str()));
                };
                let low = self.bind_literal(low, kind);
                let high = self.bind_literal(high, kind);
                let keyword = if operator == FilterOperator::Nbetween {
                    "NOT BETWEEN"
                } else {
                    "BETWEEN"
                };
                format!("{column} {keyword} {low} AND {high}")
            }
            FilterOperator::Empty | FilterOperator::Nempty => {
                let wanted = literal.as_bool().unwrap_or(true);
                let blank = self.bind(SqlValue::Text(String::new()), Some(ColumnKind::Text));
                if wanted == (operator == FilterOperator::Empty) {
                    format!("({column} IS NULL OR {column} = {blank})")
                } else {
                    format!("({column} IS NOT NULL AND {column} <> {blank})")
                }
            }
        };
        Ok(sql)
    }

    fn like(&mut self, column: &str, pattern: String, negated: bool) -> String {
        let placeholder = self.bind(SqlValue::Text(pattern), Some(ColumnKind::Text));
        let keyword = if negated { "NOT LIKE" } else { "LIKE" };
        format!("{column} {keyword} {placeholder} ESCAPE '\\'")
    }

    fn compare_user_attribute(
        &mut self,
        column: &str,
        operator: FilterOperator,
        attribute: &UserAttribute,
    ) -> AppResult<String> {
        let lookup = self.user_attribute(attribute)?;
        let sql = match operator {
            FilterOperator::In => format!("{column} IN {lookup}"),
            FilterOperator::Nin => format!("{column} NOT IN {lookup}"),
            FilterOperator::Eq
            | FilterOperator::Neq
            | FilterOperator::Lt
            | FilterOperator::Lte
            | FilterOperator::Gt
            | FilterOperator::Gte => {
                format!("{column} {} {lookup}", comparison_symbol(operator))
            }
            other => return Err(invalid_operand(other.as_str())),
        };
        Ok(sql)
    }

    /// Nests one scalar sub-select per path step, starting from the user id.
    fn user_attribute(&mut self, attribute: &UserAttribute) -> AppResult<String> {
        let first = attribute.steps.first().ok_or_else(|| {
            AppError::Internal("user attribute lookup has no steps".to_owned())
        })?;
        let mut expression = self.bind_literal(&Value::String(attribute.user.clone()), first.key_kind);
        for step in &attribute.steps {
            let alias = self.alias("u");
            expression = format!(
                "(SELECT {} FROM {} AS {} WHERE {} = {expression})",
                self.column(&alias, &step.field),
                self.quote(&step.collection),
                self.quote(&alias),
                self.column(&alias, &step.key_field),
            );
        }
        Ok(expression)
    }

    fn related(&mut self, condition: &RelatedCondition, alias: &str) -> AppResult<String> {
        let related = self.alias("s");
        let (collection, link) = match &condition.link {
            RelatedLink::ManyToOne {
                foreign_key,
                collection,
                primary_key,
            } => (
                collection,
                format!(
                    "{} = {}",
                    self.column(&related, primary_key),
                    self.column(alias, foreign_key)
                ),
            ),
            RelatedLink::OneToMany {
                collection,
                foreign_key,
                parent_key,
            } => (
                collection,
                format!(
                    "{} = {}",
                    self.column(&related, foreign_key),
                    self.column(alias, parent_key)
                ),
            ),
            RelatedLink::AnyToOne {
                foreign_key,
                collection_field,
                collection,
                primary_key,
            } => {
                let name = self.bind(SqlValue::Text(collection.clone()), Some(ColumnKind::Text));
                (
                    collection,
                    format!(
                        "{} = {name} AND {} = {}",
                        self.column(alias, collection_field),
                        self.dialect.cast_to_text(&self.column(&related, primary_key)),
                        self.dialect.cast_to_text(&self.column(alias, foreign_key)),
                    ),
                )
            }
        };

        let inner = self.filter(&condition.filter, &related)?;
        let exists = match condition.quantifier {
            RelationQuantifier::None => "NOT EXISTS",
            RelationQuantifier::Direct | RelationQuantifier::Some => "EXISTS",
        };
        Ok(format!(
            "{exists} (SELECT 1 FROM {} AS {} WHERE {link} AND {inner})",
            self.quote(collection),
            self.quote(&related)
        ))
    }
}

fn comparison_symbol(operator: FilterOperator) -> &'static str {
    match operator {
        FilterOperator::Neq => "<>",
        FilterOperator::Lt => "<",
        FilterOperator::Lte => "<=",
        FilterOperator::Gt => ">",
        FilterOperator::Gte => ">=",
        _ => "=",
    }
}
