//! Evaluation of the query (filter) language: a recursive predicate over documents.

use std::{cmp::Ordering, collections::HashMap};

use regex::Regex;

use crate::{
    bson::{Bson, Document, Regex as BsonRegex},
    bson_util,
    collation::Collation,
    engine::aggregate::expr,
    error::{Error, Result},
};

/// Evaluation context for a filter: the active collation plus any aggregation variables in scope
/// (populated when a filter runs inside a `$lookup` inner pipeline so `$expr` can see `$$let`
/// bindings).
pub(crate) struct MatchContext<'a> {
    pub(crate) collation: Option<&'a Collation>,
    pub(crate) variables: Option<&'a HashMap<String, Bson>>,
}

impl<'a> MatchContext<'a> {
    pub(crate) fn new(collation: Option<&'a Collation>) -> Self {
        Self {
            collation,
            variables: None,
        }
    }

    pub(crate) fn with_variables(
        collation: Option<&'a Collation>,
        variables: &'a HashMap<String, Bson>,
    ) -> Self {
        Self {
            collation,
            variables: Some(variables),
        }
    }
}

/// Evaluates `filter` against `doc`. The top level is an implicit conjunction over its entries.
pub(crate) fn matches(filter: &Document, doc: &Document, ctx: &MatchContext<'_>) -> Result<bool> {
    for (key, condition) in filter.iter() {
        if !match_clause(key, condition, doc, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_clause(key: &str, condition: &Bson, doc: &Document, ctx: &MatchContext<'_>) -> Result<bool> {
    match key {
        "$and" => {
            let clauses = logical_operands(key, condition)?;
            for clause in clauses {
                if !matches(clause, doc, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "$or" => {
            let clauses = logical_operands(key, condition)?;
            for clause in clauses {
                if matches(clause, doc, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        "$nor" => {
            let clauses = logical_operands(key, condition)?;
            for clause in clauses {
                if matches(clause, doc, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "$expr" => {
            let value = expr::evaluate(condition, doc, ctx.variables)?;
            Ok(expr::is_truthy(&value))
        }
        "$comment" => Ok(true),
        _ if key.starts_with('$') => Err(Error::bad_value(format!(
            "unknown top level operator: {}",
            key
        ))),
        path => match_field(path, condition, doc, ctx),
    }
}

fn logical_operands<'a>(key: &str, condition: &'a Bson) -> Result<Vec<&'a Document>> {
    let array = match condition {
        Bson::Array(array) if !array.is_empty() => array,
        _ => {
            return Err(Error::bad_value(format!(
                "{} must be a nonempty array",
                key
            )))
        }
    };
    array
        .iter()
        .map(|clause| match clause {
            Bson::Document(doc) => Ok(doc),
            _ => Err(Error::bad_value(format!(
                "{} elements must be documents",
                key
            ))),
        })
        .collect()
}

fn match_field(path: &str, condition: &Bson, doc: &Document, ctx: &MatchContext<'_>) -> Result<bool> {
    let leaves = bson_util::path_values(doc, path);

    if let Bson::Document(operators) = condition {
        if operators.keys().any(|k| k.starts_with('$')) {
            return match_operators(operators, &leaves, doc, ctx);
        }
    }
    Ok(eq_matches(&leaves, condition, ctx))
}

fn match_operators(
    operators: &Document,
    leaves: &[&Bson],
    doc: &Document,
    ctx: &MatchContext<'_>,
) -> Result<bool> {
    // `$options` is consumed together with `$regex`.
    let regex_options = match operators.get("$options") {
        Some(Bson::String(options)) => Some(options.as_str()),
        Some(_) => return Err(Error::bad_value("$options has to be a string")),
        None => None,
    };

    for (op, argument) in operators.iter() {
        let holds = match op.as_str() {
            "$eq" => eq_matches(leaves, argument, ctx),
            "$ne" => !eq_matches(leaves, argument, ctx),
            "$gt" => ord_matches(leaves, argument, ctx, |ord| ord == Ordering::Greater),
            "$gte" => ord_matches(leaves, argument, ctx, |ord| ord != Ordering::Less),
            "$lt" => ord_matches(leaves, argument, ctx, |ord| ord == Ordering::Less),
            "$lte" => ord_matches(leaves, argument, ctx, |ord| ord != Ordering::Greater),
            "$in" => in_matches(op, leaves, argument, ctx)?,
            "$nin" => !in_matches(op, leaves, argument, ctx)?,
            "$exists" => {
                let wanted = truthy_argument(argument);
                wanted == !leaves.is_empty()
            }
            "$type" => type_matches(leaves, argument)?,
            "$size" => {
                let size = bson_util::get_int(argument)
                    .ok_or_else(|| Error::bad_value("$size needs a number"))?;
                leaves
                    .iter()
                    .any(|leaf| matches!(leaf, Bson::Array(a) if a.len() as i64 == size))
            }
            "$regex" => regex_op_matches(leaves, argument, regex_options)?,
            "$options" => true,
            "$elemMatch" => elem_matches(leaves, argument, ctx)?,
            "$all" => all_matches(leaves, argument, ctx)?,
            "$mod" => mod_matches(leaves, argument)?,
            "$not" => !negated_matches(leaves, argument, doc, ctx)?,
            other => {
                return Err(Error::bad_value(format!(
                    "unknown operator: {}",
                    other
                )))
            }
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality with reference array semantics: a leaf matches if it equals the pattern or if it is
/// an array any of whose elements equals the pattern. A null pattern also matches a missing
/// field.
fn eq_matches(leaves: &[&Bson], target: &Bson, ctx: &MatchContext<'_>) -> bool {
    if matches!(target, Bson::Null) {
        return leaves.is_empty()
            || leaves.iter().any(|leaf| match leaf {
                Bson::Null | Bson::Undefined => true,
                Bson::Array(elements) => elements
                    .iter()
                    .any(|el| matches!(el, Bson::Null | Bson::Undefined)),
                _ => false,
            });
    }
    if let Bson::RegularExpression(pattern) = target {
        return leaves.iter().any(|leaf| regex_value_matches(pattern, leaf));
    }
    leaves.iter().any(|leaf| {
        bson_util::bson_eq(leaf, target, ctx.collation)
            || matches!(leaf, Bson::Array(elements)
                if elements.iter().any(|el| bson_util::bson_eq(el, target, ctx.collation)))
    })
}

/// Ordering comparisons only consider values of the target's type class (numeric types unified).
fn ord_matches(
    leaves: &[&Bson],
    target: &Bson,
    ctx: &MatchContext<'_>,
    pred: impl Fn(Ordering) -> bool,
) -> bool {
    expanded(leaves).any(|value| {
        bson_util::type_rank(value) == bson_util::type_rank(target)
            && pred(bson_util::cmp_bson_with(value, target, ctx.collation))
    })
}

// Leaf values plus the elements of array leaves.
fn expanded<'a>(leaves: &'a [&'a Bson]) -> impl Iterator<Item = &'a Bson> {
    leaves.iter().copied().flat_map(|leaf| match leaf {
        Bson::Array(elements) => {
            Box::new(std::iter::once(leaf).chain(elements.iter())) as Box<dyn Iterator<Item = &Bson>>
        }
        other => Box::new(std::iter::once(other)) as Box<dyn Iterator<Item = &Bson>>,
    })
}

fn in_matches(op: &str, leaves: &[&Bson], argument: &Bson, ctx: &MatchContext<'_>) -> Result<bool> {
    let targets = match argument {
        Bson::Array(targets) => targets,
        _ => return Err(Error::bad_value(format!("{} needs an array", op))),
    };
    Ok(targets.iter().any(|target| eq_matches(leaves, target, ctx)))
}

fn truthy_argument(argument: &Bson) -> bool {
    match argument {
        Bson::Boolean(b) => *b,
        other => bson_util::get_f64(other).map(|f| f != 0.0).unwrap_or(true),
    }
}

fn type_matches(leaves: &[&Bson], argument: &Bson) -> Result<bool> {
    let specs: Vec<&Bson> = match argument {
        Bson::Array(specs) => specs.iter().collect(),
        other => vec![other],
    };
    for spec in &specs {
        match spec {
            Bson::String(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {}
            _ => return Err(Error::bad_value("$type needs a string alias or type code")),
        }
    }
    Ok(expanded(leaves).any(|value| {
        specs.iter().any(|spec| match spec {
            Bson::String(alias) if alias == "number" => bson_util::is_numeric(value),
            Bson::String(alias) => bson_util::type_name(value) == alias,
            other => bson_util::get_int(other) == Some(i64::from(bson_util::type_code(value))),
        })
    }))
}

fn regex_op_matches(leaves: &[&Bson], argument: &Bson, options: Option<&str>) -> Result<bool> {
    let pattern = match argument {
        Bson::String(pattern) => BsonRegex {
            pattern: pattern.clone(),
            options: options.unwrap_or_default().to_string(),
        },
        Bson::RegularExpression(re) => {
            if options.is_some() && !re.options.is_empty() {
                return Err(Error::bad_value(
                    "options set in both $regex and $options",
                ));
            }
            BsonRegex {
                pattern: re.pattern.clone(),
                options: options.unwrap_or(&re.options).to_string(),
            }
        }
        _ => return Err(Error::bad_value("$regex has to be a string")),
    };
    Ok(leaves.iter().any(|leaf| regex_value_matches(&pattern, leaf)))
}

fn regex_value_matches(pattern: &BsonRegex, value: &Bson) -> bool {
    let compiled = match compile_regex(pattern) {
        Ok(compiled) => compiled,
        Err(_) => return false,
    };
    match value {
        Bson::String(s) => compiled.is_match(s),
        Bson::RegularExpression(other) => {
            other.pattern == pattern.pattern && other.options == pattern.options
        }
        Bson::Array(elements) => elements.iter().any(|el| match el {
            Bson::String(s) => compiled.is_match(s),
            Bson::RegularExpression(other) => {
                other.pattern == pattern.pattern && other.options == pattern.options
            }
            _ => false,
        }),
        _ => false,
    }
}

/// Compiles a wire-format regex. The `i`, `m`, `s`, and `x` options map onto inline flags.
pub(crate) fn compile_regex(pattern: &BsonRegex) -> Result<Regex> {
    let mut builder = regex::RegexBuilder::new(&pattern.pattern);
    for option in pattern.options.chars() {
        match option {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            _ => &mut builder,
        };
    }
    builder
        .build()
        .map_err(|e| Error::bad_value(format!("invalid regex: {}", e)))
}

fn elem_matches(leaves: &[&Bson], argument: &Bson, ctx: &MatchContext<'_>) -> Result<bool> {
    let condition = match argument {
        Bson::Document(condition) => condition,
        _ => return Err(Error::bad_value("$elemMatch needs a document")),
    };
    let operator_form = condition.keys().all(|k| k.starts_with('$'));

    for leaf in leaves {
        if let Bson::Array(elements) = leaf {
            for element in elements {
                let hit = if operator_form && !condition.is_empty() {
                    let element_leaves = [element];
                    match_operators(condition, &element_leaves, &Document::new(), ctx)?
                } else {
                    match element {
                        Bson::Document(element_doc) => matches(condition, element_doc, ctx)?,
                        _ => false,
                    }
                };
                if hit {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

fn all_matches(leaves: &[&Bson], argument: &Bson, ctx: &MatchContext<'_>) -> Result<bool> {
    let required = match argument {
        Bson::Array(required) => required,
        _ => return Err(Error::bad_value("$all needs an array")),
    };
    Ok(required
        .iter()
        .all(|target| eq_matches(leaves, target, ctx)))
}

fn mod_matches(leaves: &[&Bson], argument: &Bson) -> Result<bool> {
    let parts = match argument {
        Bson::Array(parts) if parts.len() == 2 => parts,
        Bson::Array(_) => {
            return Err(Error::bad_value(
                "malformed mod, needs to be [divisor, remainder]",
            ))
        }
        _ => return Err(Error::bad_value("malformed mod, needs an array")),
    };
    let divisor = bson_util::get_int(&parts[0])
        .ok_or_else(|| Error::bad_value("malformed mod, divisor must be a number"))?;
    let remainder = bson_util::get_int(&parts[1])
        .ok_or_else(|| Error::bad_value("malformed mod, remainder must be a number"))?;
    if divisor == 0 {
        return Err(Error::bad_value("divisor cannot be 0"));
    }
    Ok(expanded(leaves).any(|value| {
        bson_util::get_f64(value)
            .map(|f| (f.trunc() as i64) % divisor == remainder)
            .unwrap_or(false)
    }))
}

fn negated_matches(
    leaves: &[&Bson],
    argument: &Bson,
    doc: &Document,
    ctx: &MatchContext<'_>,
) -> Result<bool> {
    match argument {
        Bson::Document(operators) if operators.keys().all(|k| k.starts_with('$')) => {
            match_operators(operators, leaves, doc, ctx)
        }
        Bson::RegularExpression(pattern) => {
            Ok(leaves.iter().any(|leaf| regex_value_matches(pattern, leaf)))
        }
        _ => Err(Error::bad_value("$not needs a regex or a document")),
    }
}
