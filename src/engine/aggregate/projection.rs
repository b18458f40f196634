//! `$project`-style document reshaping, shared by the `$project` stage and `find` projections.

use std::collections::{BTreeMap, HashMap};

use crate::{
    bson::{Bson, Document},
    bson_util,
    engine::aggregate::expr,
    error::{Error, Result},
};

enum Action {
    Include,
    Exclude,
    Compute(Bson),
}

struct PathNode {
    children: BTreeMap<String, PathNode>,
    action: Option<Action>,
}

impl PathNode {
    fn new() -> Self {
        Self {
            children: BTreeMap::new(),
            action: None,
        }
    }

    fn insert(&mut self, path: &str, action: Action) -> Result<()> {
        let mut node = self;
        for segment in path.split('.') {
            node = node
                .children
                .entry(segment.to_string())
                .or_insert_with(PathNode::new);
        }
        if node.action.is_some() || !node.children.is_empty() {
            return Err(Error::bad_value(format!(
                "invalid projection: path collision at {}",
                path
            )));
        }
        node.action = Some(action);
        Ok(())
    }
}

/// Classifies one projection value: numeric/boolean values toggle inclusion, anything else is a
/// computed expression.
fn classify(value: &Bson) -> Action {
    match value {
        Bson::Boolean(included) => {
            if *included {
                Action::Include
            } else {
                Action::Exclude
            }
        }
        other => match bson_util::get_f64(other) {
            Some(f) if f == 0.0 => Action::Exclude,
            Some(_) => Action::Include,
            None => Action::Compute(other.clone()),
        },
    }
}

/// Applies a projection specification to one document.
pub(crate) fn apply_projection(doc: &Document, spec: &Document) -> Result<Document> {
    apply_projection_with_vars(doc, spec, None)
}

pub(crate) fn apply_projection_with_vars(
    doc: &Document,
    spec: &Document,
    vars: Option<&HashMap<String, Bson>>,
) -> Result<Document> {
    if spec.is_empty() {
        return Err(Error::bad_value("projection specification must not be empty"));
    }

    let mut root = PathNode::new();
    let mut includes = false;
    let mut excludes = false;
    let mut id_action: Option<Action> = None;

    for (path, value) in spec.iter() {
        let action = classify(value);
        if path == "_id" {
            id_action = Some(action);
            continue;
        }
        match action {
            Action::Include | Action::Compute(_) => includes = true,
            Action::Exclude => excludes = true,
        }
        root.insert(path, classify(value))?;
    }

    if includes && excludes {
        return Err(Error::bad_value(
            "cannot do exclusion on a field in inclusion projection",
        ));
    }

    // A projection of only `_id` toggles counts as its mode.
    let inclusion = if includes || excludes {
        includes
    } else {
        !matches!(id_action, Some(Action::Exclude))
    };

    let mut projected = if inclusion {
        project_include(doc, &root, doc, vars)?
    } else {
        project_exclude(doc, &root, doc, vars)?
    };

    // `_id` is carried by default; an explicit exclusion removes it, an expression recomputes it.
    match id_action {
        Some(Action::Exclude) => {
            projected.remove("_id");
        }
        Some(Action::Compute(expression)) => {
            let value = expr::evaluate(&expression, doc, vars)?;
            if !matches!(value, Bson::Undefined) {
                projected.insert("_id", value);
            }
        }
        Some(Action::Include) | None => {}
    }

    // `_id` leads the projected document when present.
    if let Some(id) = projected.remove("_id") {
        let mut ordered = Document::new();
        ordered.insert("_id", id);
        ordered.extend(projected);
        projected = ordered;
    }

    Ok(projected)
}

fn project_include(
    doc: &Document,
    node: &PathNode,
    root_doc: &Document,
    vars: Option<&HashMap<String, Bson>>,
) -> Result<Document> {
    let mut out = Document::new();

    if doc.contains_key("_id") && node.children.get("_id").is_none() {
        out.insert("_id", doc.get("_id").cloned().unwrap_or(Bson::Null));
    }

    // Existing fields first, in document order.
    for (key, value) in doc.iter() {
        if key == "_id" {
            continue;
        }
        if let Some(child) = node.children.get(key) {
            match &child.action {
                Some(Action::Include) => {
                    out.insert(key.clone(), value.clone());
                }
                Some(Action::Compute(_)) | Some(Action::Exclude) => {}
                None => {
                    if let Some(subset) = include_subtree(value, child, root_doc, vars)? {
                        out.insert(key.clone(), subset);
                    }
                }
            }
        }
    }

    // Computed fields afterwards, in specification order.
    append_computed(&mut out, node, root_doc, vars)?;

    Ok(out)
}

fn append_computed(
    out: &mut Document,
    node: &PathNode,
    root_doc: &Document,
    vars: Option<&HashMap<String, Bson>>,
) -> Result<()> {
    for (key, child) in &node.children {
        if let Some(Action::Compute(expression)) = &child.action {
            let value = expr::evaluate(expression, root_doc, vars)?;
            if !matches!(value, Bson::Undefined) {
                crate::engine::update::set_path(out, key, value)?;
            }
        } else if child.action.is_none() && !out.contains_key(key) {
            // A nested computed path under a field absent from the document.
            let mut nested = Document::new();
            append_computed(&mut nested, child, root_doc, vars)?;
            if !nested.is_empty() {
                out.insert(key.clone(), Bson::Document(nested));
            }
        }
    }
    Ok(())
}

fn include_subtree(
    value: &Bson,
    node: &PathNode,
    root_doc: &Document,
    vars: Option<&HashMap<String, Bson>>,
) -> Result<Option<Bson>> {
    match value {
        Bson::Document(doc) => {
            let mut out = Document::new();
            for (key, value) in doc.iter() {
                if let Some(child) = node.children.get(key) {
                    match &child.action {
                        Some(Action::Include) => {
                            out.insert(key.clone(), value.clone());
                        }
                        Some(Action::Compute(expression)) => {
                            let computed = expr::evaluate(expression, root_doc, vars)?;
                            if !matches!(computed, Bson::Undefined) {
                                out.insert(key.clone(), computed);
                            }
                        }
                        Some(Action::Exclude) => {}
                        None => {
                            if let Some(subset) = include_subtree(value, child, root_doc, vars)? {
                                out.insert(key.clone(), subset);
                            }
                        }
                    }
                }
            }
            Ok(Some(Bson::Document(out)))
        }
        // Arrays project each document element through the remaining path.
        Bson::Array(elements) => {
            let mut out = Vec::new();
            for element in elements {
                if let Some(projected) = include_subtree(element, node, root_doc, vars)? {
                    out.push(projected);
                }
            }
            Ok(Some(Bson::Array(out)))
        }
        _ => Ok(None),
    }
}

fn project_exclude(
    doc: &Document,
    node: &PathNode,
    root_doc: &Document,
    vars: Option<&HashMap<String, Bson>>,
) -> Result<Document> {
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        match node.children.get(key) {
            Some(child) => match &child.action {
                Some(Action::Exclude) => {}
                Some(Action::Include) | Some(Action::Compute(_)) => {
                    out.insert(key.clone(), value.clone());
                }
                None => {
                    out.insert(key.clone(), exclude_subtree(value, child, root_doc, vars)?);
                }
            },
            None => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(out)
}

fn exclude_subtree(
    value: &Bson,
    node: &PathNode,
    root_doc: &Document,
    vars: Option<&HashMap<String, Bson>>,
) -> Result<Bson> {
    match value {
        Bson::Document(doc) => Ok(Bson::Document(project_exclude(doc, node, root_doc, vars)?)),
        Bson::Array(elements) => {
            let mut out = Vec::with_capacity(elements.len());
            for element in elements {
                out.push(exclude_subtree(element, node, root_doc, vars)?);
            }
            Ok(Bson::Array(out))
        }
        other => Ok(other.clone()),
    }
}
