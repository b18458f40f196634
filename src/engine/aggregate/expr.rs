//! The aggregation expression sub-language: field paths, literals, variables, and operator
//! expressions. Missing values are represented internally by `Bson::Undefined` and stripped when
//! documents are materialized.

use std::{cmp::Ordering, collections::HashMap};

use crate::{
    bson::{Bson, DateTime, Document},
    bson_util,
    error::{Error, Result},
};

/// Evaluates `expr` against `current`, with `vars` providing `$$name` bindings (`ROOT`,
/// `CURRENT`, and `REMOVE` are always in scope).
pub(crate) fn evaluate(
    expr: &Bson,
    current: &Document,
    vars: Option<&HashMap<String, Bson>>,
) -> Result<Bson> {
    let empty = HashMap::new();
    evaluate_inner(expr, current, vars.unwrap_or(&empty))
}

fn evaluate_inner(expr: &Bson, current: &Document, vars: &HashMap<String, Bson>) -> Result<Bson> {
    match expr {
        Bson::String(s) if s.starts_with("$$") => {
            let (name, path) = match s[2..].split_once('.') {
                Some((name, path)) => (name, Some(path)),
                None => (&s[2..], None),
            };
            let base = match name {
                "ROOT" | "CURRENT" => Bson::Document(current.clone()),
                "REMOVE" => Bson::Undefined,
                "NOW" => Bson::DateTime(DateTime::now()),
                other => vars.get(other).cloned().ok_or_else(|| {
                    Error::bad_value(format!("use of undefined variable: {}", other))
                })?,
            };
            Ok(match path {
                Some(path) => value_at_expr_path(&base, path),
                None => base,
            })
        }
        Bson::String(s) if s.starts_with('$') => {
            Ok(value_at_expr_path(&Bson::Document(current.clone()), &s[1..]))
        }
        Bson::Array(elements) => {
            let evaluated = elements
                .iter()
                .map(|el| evaluate_inner(el, current, vars))
                .collect::<Result<Vec<_>>>()?;
            Ok(Bson::Array(evaluated))
        }
        Bson::Document(doc) => {
            if let Some((op, argument)) = single_operator(doc) {
                return evaluate_operator(op, argument, current, vars);
            }
            let mut out = Document::new();
            for (key, value) in doc.iter() {
                if key.starts_with('$') {
                    return Err(Error::bad_value(format!(
                        "unrecognized expression '{}'",
                        key
                    )));
                }
                let value = evaluate_inner(value, current, vars)?;
                if !matches!(value, Bson::Undefined) {
                    out.insert(key.clone(), value);
                }
            }
            Ok(Bson::Document(out))
        }
        literal => Ok(literal.clone()),
    }
}

fn single_operator(doc: &Document) -> Option<(&str, &Bson)> {
    if doc.len() == 1 {
        let (key, value) = doc.iter().next()?;
        if key.starts_with('$') {
            return Some((key.as_str(), value));
        }
    }
    None
}

/// Aggregation field paths: documents traverse by field name; arrays map the remaining path over
/// their elements, collecting the values that resolve.
fn value_at_expr_path(value: &Bson, path: &str) -> Bson {
    let mut current = value.clone();
    for segment in path.split('.') {
        current = descend(&current, segment);
        if matches!(current, Bson::Undefined) {
            break;
        }
    }
    current
}

fn descend(value: &Bson, segment: &str) -> Bson {
    match value {
        Bson::Document(doc) => doc.get(segment).cloned().unwrap_or(Bson::Undefined),
        Bson::Array(elements) => {
            let collected: Vec<Bson> = elements
                .iter()
                .map(|el| descend(el, segment))
                .filter(|v| !matches!(v, Bson::Undefined))
                .collect();
            Bson::Array(collected)
        }
        _ => Bson::Undefined,
    }
}

/// The standard truthiness rules: false, null, missing, 0, and NaN are falsy; everything else is
/// truthy.
pub(crate) fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null | Bson::Undefined => false,
        other => match bson_util::get_f64(other) {
            Some(f) => f != 0.0 && !f.is_nan(),
            None => true,
        },
    }
}

fn is_nullish(value: &Bson) -> bool {
    matches!(value, Bson::Null | Bson::Undefined)
}

fn evaluate_operator(
    op: &str,
    argument: &Bson,
    current: &Document,
    vars: &HashMap<String, Bson>,
) -> Result<Bson> {
    match op {
        "$literal" => return Ok(argument.clone()),
        "$convert" => return convert_operator(argument, current, vars),
        "$map" => return map_operator(argument, current, vars),
        "$filter" => return filter_operator(argument, current, vars),
        "$cond" => return cond_operator(argument, current, vars),
        "$switch" => return switch_operator(argument, current, vars),
        "$ifNull" => return if_null_operator(argument, current, vars),
        "$and" => {
            for operand in operand_list(argument) {
                if !is_truthy(&evaluate_inner(operand, current, vars)?) {
                    return Ok(Bson::Boolean(false));
                }
            }
            return Ok(Bson::Boolean(true));
        }
        "$or" => {
            for operand in operand_list(argument) {
                if is_truthy(&evaluate_inner(operand, current, vars)?) {
                    return Ok(Bson::Boolean(true));
                }
            }
            return Ok(Bson::Boolean(false));
        }
        _ => {}
    }

    // Remaining operators evaluate their operands eagerly.
    let operands: Vec<Bson> = operand_list(argument)
        .into_iter()
        .map(|operand| evaluate_inner(operand, current, vars))
        .collect::<Result<Vec<_>>>()?;

    match op {
        "$not" => Ok(Bson::Boolean(!is_truthy(required(op, &operands, 0)?))),
        "$add" => add_operator(&operands),
        "$subtract" => subtract_operator(&operands),
        "$multiply" => {
            let mut product = 1.0;
            let mut all_int = true;
            for operand in &operands {
                if is_nullish(operand) {
                    return Ok(Bson::Null);
                }
                let f = numeric_operand("$multiply", operand)?;
                all_int &= bson_util::get_int(operand).is_some();
                product *= f;
            }
            Ok(numeric_result(product, all_int))
        }
        "$divide" => {
            let (a, b) = binary_operands("$divide", &operands)?;
            if is_nullish(a) || is_nullish(b) {
                return Ok(Bson::Null);
            }
            let dividend = numeric_operand("$divide", a)?;
            let divisor = numeric_operand("$divide", b)?;
            if divisor == 0.0 {
                return Err(Error::bad_value("can't $divide by zero"));
            }
            Ok(Bson::Double(dividend / divisor))
        }
        "$mod" => {
            let (a, b) = binary_operands("$mod", &operands)?;
            if is_nullish(a) || is_nullish(b) {
                return Ok(Bson::Null);
            }
            let x = numeric_operand("$mod", a)?;
            let y = numeric_operand("$mod", b)?;
            if y == 0.0 {
                return Err(Error::bad_value("can't $mod by zero"));
            }
            match (bson_util::get_int(a), bson_util::get_int(b)) {
                (Some(x), Some(y)) => Ok(Bson::Int64(x % y)),
                _ => Ok(Bson::Double(x % y)),
            }
        }
        "$cmp" | "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let a = required(op, &operands, 0)?;
            let b = required(op, &operands, 1)?;
            let ord = bson_util::cmp_bson(a, b);
            Ok(match op {
                "$cmp" => Bson::Int32(match ord {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }),
                "$eq" => Bson::Boolean(ord == Ordering::Equal),
                "$ne" => Bson::Boolean(ord != Ordering::Equal),
                "$gt" => Bson::Boolean(ord == Ordering::Greater),
                "$gte" => Bson::Boolean(ord != Ordering::Less),
                "$lt" => Bson::Boolean(ord == Ordering::Less),
                _ => Bson::Boolean(ord != Ordering::Greater),
            })
        }
        "$concat" => {
            let mut out = String::new();
            for operand in &operands {
                match operand {
                    Bson::String(s) => out.push_str(s),
                    Bson::Null | Bson::Undefined => return Ok(Bson::Null),
                    other => {
                        return Err(Error::type_mismatch(format!(
                            "$concat only supports strings, not {}",
                            bson_util::type_name(other)
                        )))
                    }
                }
            }
            Ok(Bson::String(out))
        }
        "$toLower" | "$toUpper" => {
            let s = match required(op, &operands, 0)? {
                Bson::String(s) => s.clone(),
                Bson::Null | Bson::Undefined => String::new(),
                other => format_as_string(other)?,
            };
            Ok(Bson::String(if op == "$toLower" {
                s.to_lowercase()
            } else {
                s.to_uppercase()
            }))
        }
        "$substr" | "$substrBytes" => substr_bytes(op, &operands),
        "$substrCP" => substr_code_points(&operands),
        "$split" => {
            let (input, delimiter) = (required(op, &operands, 0)?, required(op, &operands, 1)?);
            if is_nullish(input) {
                return Ok(Bson::Null);
            }
            match (input, delimiter) {
                (Bson::String(input), Bson::String(delimiter)) => {
                    if delimiter.is_empty() {
                        return Err(Error::bad_value("$split delimiter must not be empty"));
                    }
                    Ok(Bson::Array(
                        input
                            .split(delimiter.as_str())
                            .map(|part| Bson::String(part.to_string()))
                            .collect(),
                    ))
                }
                _ => Err(Error::type_mismatch("$split requires string arguments")),
            }
        }
        "$size" => match required(op, &operands, 0)? {
            Bson::Array(elements) => Ok(Bson::Int32(elements.len() as i32)),
            other => Err(Error::type_mismatch(format!(
                "the argument to $size must be an array, but was of type: {}",
                bson_util::type_name(other)
            ))),
        },
        "$arrayElemAt" => {
            let (array, index) = binary_operands("$arrayElemAt", &operands)?;
            if is_nullish(array) {
                return Ok(Bson::Null);
            }
            let elements = match array {
                Bson::Array(elements) => elements,
                _ => return Err(Error::type_mismatch("$arrayElemAt needs an array")),
            };
            let index = bson_util::get_int(index)
                .ok_or_else(|| Error::type_mismatch("$arrayElemAt needs a numeric index"))?;
            let position = if index < 0 {
                elements.len() as i64 + index
            } else {
                index
            };
            Ok(usize::try_from(position)
                .ok()
                .and_then(|i| elements.get(i))
                .cloned()
                .unwrap_or(Bson::Undefined))
        }
        "$in" => {
            let value = required(op, &operands, 0)?;
            match required(op, &operands, 1)? {
                Bson::Array(elements) => Ok(Bson::Boolean(
                    elements.iter().any(|el| bson_util::bson_eq(el, value, None)),
                )),
                _ => Err(Error::type_mismatch("$in requires an array as a second argument")),
            }
        }
        "$type" => Ok(Bson::String(
            match required(op, &operands, 0)? {
                Bson::Undefined => "missing",
                other => bson_util::type_name(other),
            }
            .to_string(),
        )),
        "$toString" => convert_to("string", required(op, &operands, 0)?),
        "$toInt" => convert_to("int", required(op, &operands, 0)?),
        "$toLong" => convert_to("long", required(op, &operands, 0)?),
        "$toDouble" => convert_to("double", required(op, &operands, 0)?),
        "$toBool" => convert_to("bool", required(op, &operands, 0)?),
        other => Err(Error::not_implemented(format!(
            "unsupported aggregation expression operator '{}'",
            other
        ))),
    }
}

fn operand_list(argument: &Bson) -> Vec<&Bson> {
    match argument {
        Bson::Array(operands) => operands.iter().collect(),
        single => vec![single],
    }
}

fn required<'a>(op: &str, operands: &'a [Bson], index: usize) -> Result<&'a Bson> {
    operands
        .get(index)
        .ok_or_else(|| Error::bad_value(format!("{} requires {} arguments", op, index + 1)))
}

fn binary_operands<'a>(op: &str, operands: &'a [Bson]) -> Result<(&'a Bson, &'a Bson)> {
    if operands.len() != 2 {
        return Err(Error::bad_value(format!(
            "{} requires exactly 2 arguments, got {}",
            op,
            operands.len()
        )));
    }
    Ok((&operands[0], &operands[1]))
}

fn numeric_operand(op: &str, value: &Bson) -> Result<f64> {
    bson_util::get_f64(value).ok_or_else(|| {
        Error::type_mismatch(format!(
            "{} only supports numeric types, not {}",
            op,
            bson_util::type_name(value)
        ))
    })
}

fn numeric_result(value: f64, prefer_int: bool) -> Bson {
    if prefer_int && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        let as_int = value as i64;
        if let Ok(small) = i32::try_from(as_int) {
            return Bson::Int32(small);
        }
        return Bson::Int64(as_int);
    }
    Bson::Double(value)
}

fn add_operator(operands: &[Bson]) -> Result<Bson> {
    let mut sum = 0.0;
    let mut all_int = true;
    let mut date_millis: Option<i64> = None;
    for operand in operands {
        match operand {
            Bson::Null | Bson::Undefined => return Ok(Bson::Null),
            Bson::DateTime(dt) => {
                if date_millis.is_some() {
                    return Err(Error::bad_value("only one date allowed in an $add expression"));
                }
                date_millis = Some(dt.timestamp_millis());
            }
            other => {
                let f = numeric_operand("$add", other)?;
                all_int &= bson_util::get_int(other).is_some();
                sum += f;
            }
        }
    }
    match date_millis {
        Some(millis) => Ok(Bson::DateTime(DateTime::from_millis(millis + sum as i64))),
        None => Ok(numeric_result(sum, all_int)),
    }
}

fn subtract_operator(operands: &[Bson]) -> Result<Bson> {
    if operands.len() != 2 {
        return Err(Error::bad_value("$subtract requires exactly 2 arguments"));
    }
    match (&operands[0], &operands[1]) {
        (a, b) if is_nullish(a) || is_nullish(b) => Ok(Bson::Null),
        (Bson::DateTime(a), Bson::DateTime(b)) => {
            Ok(Bson::Int64(a.timestamp_millis() - b.timestamp_millis()))
        }
        (Bson::DateTime(a), b) => {
            let delta = numeric_operand("$subtract", b)?;
            Ok(Bson::DateTime(DateTime::from_millis(
                a.timestamp_millis() - delta as i64,
            )))
        }
        (a, b) => {
            let x = numeric_operand("$subtract", a)?;
            let y = numeric_operand("$subtract", b)?;
            let all_int =
                bson_util::get_int(a).is_some() && bson_util::get_int(b).is_some();
            Ok(numeric_result(x - y, all_int))
        }
    }
}

fn cond_operator(argument: &Bson, current: &Document, vars: &HashMap<String, Bson>) -> Result<Bson> {
    let (condition, then_branch, else_branch) = match argument {
        Bson::Array(parts) if parts.len() == 3 => (&parts[0], &parts[1], &parts[2]),
        Bson::Document(doc) => {
            let get = |field: &str| {
                doc.get(field)
                    .ok_or_else(|| Error::bad_value(format!("missing '{}' parameter to $cond", field)))
            };
            (get("if")?, get("then")?, get("else")?)
        }
        _ => return Err(Error::bad_value("$cond requires either 3 arguments or an if/then/else document")),
    };
    if is_truthy(&evaluate_inner(condition, current, vars)?) {
        evaluate_inner(then_branch, current, vars)
    } else {
        evaluate_inner(else_branch, current, vars)
    }
}

fn if_null_operator(
    argument: &Bson,
    current: &Document,
    vars: &HashMap<String, Bson>,
) -> Result<Bson> {
    let operands = operand_list(argument);
    if operands.len() < 2 {
        return Err(Error::bad_value("$ifNull needs at least 2 arguments"));
    }
    for operand in &operands[..operands.len() - 1] {
        let value = evaluate_inner(operand, current, vars)?;
        if !is_nullish(&value) {
            return Ok(value);
        }
    }
    evaluate_inner(operands[operands.len() - 1], current, vars)
}

fn switch_operator(
    argument: &Bson,
    current: &Document,
    vars: &HashMap<String, Bson>,
) -> Result<Bson> {
    let spec = match argument {
        Bson::Document(spec) => spec,
        _ => return Err(Error::bad_value("$switch requires a document argument")),
    };
    let branches = match spec.get("branches") {
        Some(Bson::Array(branches)) => branches,
        _ => return Err(Error::bad_value("$switch requires a 'branches' array")),
    };
    for branch in branches {
        let branch = match branch {
            Bson::Document(branch) => branch,
            _ => return Err(Error::bad_value("$switch branches must be documents")),
        };
        let case = branch
            .get("case")
            .ok_or_else(|| Error::bad_value("$switch branch missing 'case'"))?;
        if is_truthy(&evaluate_inner(case, current, vars)?) {
            let then = branch
                .get("then")
                .ok_or_else(|| Error::bad_value("$switch branch missing 'then'"))?;
            return evaluate_inner(then, current, vars);
        }
    }
    match spec.get("default") {
        Some(default) => evaluate_inner(default, current, vars),
        None => Err(Error::bad_value(
            "$switch could not find a matching branch and no default was specified",
        )),
    }
}

fn map_operator(argument: &Bson, current: &Document, vars: &HashMap<String, Bson>) -> Result<Bson> {
    let spec = match argument {
        Bson::Document(spec) => spec,
        _ => return Err(Error::bad_value("$map requires a document argument")),
    };
    let input = evaluate_inner(
        spec.get("input")
            .ok_or_else(|| Error::bad_value("$map requires an 'input'"))?,
        current,
        vars,
    )?;
    if is_nullish(&input) {
        return Ok(Bson::Null);
    }
    let elements = match input {
        Bson::Array(elements) => elements,
        _ => return Err(Error::type_mismatch("input to $map must be an array")),
    };
    let as_name = binding_name(spec)?;
    let body = spec
        .get("in")
        .ok_or_else(|| Error::bad_value("$map requires an 'in' expression"))?;

    let mut out = Vec::with_capacity(elements.len());
    let mut scoped = vars.clone();
    for element in elements {
        scoped.insert(as_name.clone(), element);
        out.push(evaluate_inner(body, current, &scoped)?);
    }
    Ok(Bson::Array(out))
}

fn filter_operator(
    argument: &Bson,
    current: &Document,
    vars: &HashMap<String, Bson>,
) -> Result<Bson> {
    let spec = match argument {
        Bson::Document(spec) => spec,
        _ => return Err(Error::bad_value("$filter requires a document argument")),
    };
    let input = evaluate_inner(
        spec.get("input")
            .ok_or_else(|| Error::bad_value("$filter requires an 'input'"))?,
        current,
        vars,
    )?;
    if is_nullish(&input) {
        return Ok(Bson::Null);
    }
    let elements = match input {
        Bson::Array(elements) => elements,
        _ => return Err(Error::type_mismatch("input to $filter must be an array")),
    };
    let as_name = binding_name(spec)?;
    let condition = spec
        .get("cond")
        .ok_or_else(|| Error::bad_value("$filter requires a 'cond' expression"))?;

    let mut out = Vec::new();
    let mut scoped = vars.clone();
    for element in elements {
        scoped.insert(as_name.clone(), element.clone());
        if is_truthy(&evaluate_inner(condition, current, &scoped)?) {
            out.push(element);
        }
    }
    Ok(Bson::Array(out))
}

fn binding_name(spec: &Document) -> Result<String> {
    match spec.get("as") {
        Some(Bson::String(name)) if !name.is_empty() => Ok(name.clone()),
        None => Ok("this".to_string()),
        _ => Err(Error::bad_value("'as' must be a non-empty string")),
    }
}

fn convert_operator(
    argument: &Bson,
    current: &Document,
    vars: &HashMap<String, Bson>,
) -> Result<Bson> {
    let spec = match argument {
        Bson::Document(spec) => spec,
        _ => return Err(Error::bad_value("$convert expects a document argument")),
    };
    let input = evaluate_inner(
        spec.get("input")
            .ok_or_else(|| Error::bad_value("$convert requires an 'input'"))?,
        current,
        vars,
    )?;
    let to = match spec.get("to") {
        Some(Bson::String(to)) => to.clone(),
        Some(other) => match bson_util::get_int(other) {
            Some(code) => type_alias_for_code(code)?.to_string(),
            None => return Err(Error::bad_value("$convert 'to' must be a type name or code")),
        },
        None => return Err(Error::bad_value("$convert requires a 'to'")),
    };

    if is_nullish(&input) {
        return match spec.get("onNull") {
            Some(fallback) => evaluate_inner(fallback, current, vars),
            None => Ok(Bson::Null),
        };
    }

    match convert_to(&to, &input) {
        Ok(value) => Ok(value),
        Err(e) => match spec.get("onError") {
            Some(fallback) => evaluate_inner(fallback, current, vars),
            None => Err(e),
        },
    }
}

fn type_alias_for_code(code: i64) -> Result<&'static str> {
    Ok(match code {
        1 => "double",
        2 => "string",
        8 => "bool",
        9 => "date",
        16 => "int",
        18 => "long",
        19 => "decimal",
        7 => "objectId",
        other => {
            return Err(Error::bad_value(format!(
                "$convert does not support type code {}",
                other
            )))
        }
    })
}

fn convert_to(to: &str, input: &Bson) -> Result<Bson> {
    if is_nullish(input) {
        return Ok(Bson::Null);
    }
    let fail = || {
        Error::bad_value(format!(
            "unsupported conversion from {} to {}",
            bson_util::type_name(input),
            to
        ))
    };
    match to {
        "string" => Ok(Bson::String(format_as_string(input)?)),
        "bool" => Ok(Bson::Boolean(is_truthy(input))),
        "double" => bson_util::get_f64(input)
            .map(Bson::Double)
            .or_else(|| match input {
                Bson::String(s) => s.parse().ok().map(Bson::Double),
                Bson::Boolean(b) => Some(Bson::Double(f64::from(u8::from(*b)))),
                Bson::DateTime(dt) => Some(Bson::Double(dt.timestamp_millis() as f64)),
                _ => None,
            })
            .ok_or_else(fail),
        "int" => to_integer(input)
            .and_then(|i| i32::try_from(i).ok())
            .map(Bson::Int32)
            .ok_or_else(fail),
        "long" => to_integer(input).map(Bson::Int64).ok_or_else(fail),
        "date" => match input {
            Bson::DateTime(_) => Ok(input.clone()),
            _ => bson_util::get_int(input)
                .map(|millis| Bson::DateTime(DateTime::from_millis(millis)))
                .ok_or_else(fail),
        },
        "objectId" => match input {
            Bson::ObjectId(_) => Ok(input.clone()),
            Bson::String(s) => s
                .parse::<crate::bson::oid::ObjectId>()
                .map(Bson::ObjectId)
                .map_err(|_| fail()),
            _ => Err(fail()),
        },
        "decimal" => Err(Error::not_implemented("conversion to decimal")),
        other => Err(Error::bad_value(format!("unknown target type '{}'", other))),
    }
}

fn to_integer(input: &Bson) -> Option<i64> {
    match input {
        Bson::Boolean(b) => Some(i64::from(u8::from(*b))),
        Bson::String(s) => s.parse().ok(),
        Bson::Double(f) => Some(f.trunc() as i64),
        other => bson_util::get_int(other),
    }
}

fn format_as_string(value: &Bson) -> Result<String> {
    Ok(match value {
        Bson::String(s) => s.clone(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        Bson::Double(f) => f.to_string(),
        Bson::Decimal128(d) => d.to_string(),
        Bson::Boolean(b) => b.to_string(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map_err(|e| Error::bad_value(format!("cannot format date: {}", e)))?,
        other => {
            return Err(Error::type_mismatch(format!(
                "cannot convert {} to string",
                bson_util::type_name(other)
            )))
        }
    })
}

fn substr_bytes(op: &str, operands: &[Bson]) -> Result<Bson> {
    if operands.len() != 3 {
        return Err(Error::bad_value(format!("{} requires 3 arguments", op)));
    }
    let input = match &operands[0] {
        Bson::String(s) => s.clone(),
        Bson::Null | Bson::Undefined => String::new(),
        other => format_as_string(other)?,
    };
    let start = bson_util::get_int(&operands[1])
        .ok_or_else(|| Error::type_mismatch(format!("{} start must be a number", op)))?;
    let length = bson_util::get_int(&operands[2])
        .ok_or_else(|| Error::type_mismatch(format!("{} length must be a number", op)))?;

    let bytes = input.as_bytes();
    let start = usize::try_from(start).unwrap_or(0).min(bytes.len());
    let end = if length < 0 {
        bytes.len()
    } else {
        start.saturating_add(length as usize).min(bytes.len())
    };
    String::from_utf8(bytes[start..end].to_vec())
        .map(Bson::String)
        .map_err(|_| Error::bad_value(format!("{} slice is not valid UTF-8", op)))
}

fn substr_code_points(operands: &[Bson]) -> Result<Bson> {
    if operands.len() != 3 {
        return Err(Error::bad_value("$substrCP requires 3 arguments"));
    }
    let input = match &operands[0] {
        Bson::String(s) => s.clone(),
        Bson::Null | Bson::Undefined => String::new(),
        other => format_as_string(other)?,
    };
    let start = bson_util::get_int(&operands[1])
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| Error::bad_value("$substrCP start must be a non-negative number"))?;
    let length = bson_util::get_int(&operands[2])
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| Error::bad_value("$substrCP length must be a non-negative number"))?;
    Ok(Bson::String(
        input.chars().skip(start).take(length).collect(),
    ))
}

#[cfg(test)]
mod test;
