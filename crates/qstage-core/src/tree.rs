//! Indented tree rendering shared by logical and physical plans.
//!
//! Output shape:
//! ```text
//! Project [a]
//! +- Filter (a > 1)
//!    +- Relation t[a]
//! ```
//! Subquery plans (inner children) are drawn one level deeper than regular
//! children, before them, with `:` connectors.

/// Borrowed view of a child node.
pub type TreeChild<'a> = Box<dyn TreeNode + 'a>;

/// A node that can be drawn by [`render_tree`].
pub trait TreeNode {
    /// One-line description of this node (no children).
    fn node_string(&self, max_fields: usize) -> String;

    /// Regular plan children, in order.
    fn tree_children(&self) -> Vec<TreeChild<'_>>;

    /// Plans hanging off this node's expressions (subqueries).
    fn inner_children(&self) -> Vec<TreeChild<'_>> {
        Vec::new()
    }
}

impl<T: TreeNode + ?Sized> TreeNode for &T {
    fn node_string(&self, max_fields: usize) -> String {
        (**self).node_string(max_fields)
    }

    fn tree_children(&self) -> Vec<TreeChild<'_>> {
        (**self).tree_children()
    }

    fn inner_children(&self) -> Vec<TreeChild<'_>> {
        (**self).inner_children()
    }
}

pub fn render_tree(node: &dyn TreeNode, max_fields: usize) -> String {
    let mut out = String::new();
    let mut last = Vec::new();
    write_node(node, &mut last, max_fields, &mut out);
    out
}

fn write_node(node: &dyn TreeNode, last: &mut Vec<bool>, max_fields: usize, out: &mut String) {
    if let Some((tail, init)) = last.split_last() {
        for &is_last in init {
            out.push_str(if is_last { "   " } else { ":  " });
        }
        out.push_str(if *tail { "+- " } else { ":- " });
    }
    out.push_str(&node.node_string(max_fields));
    out.push('\n');

    let inner = node.inner_children();
    let children = node.tree_children();

    let n_inner = inner.len();
    for (i, sub) in inner.into_iter().enumerate() {
        last.push(children.is_empty());
        last.push(i + 1 == n_inner);
        write_node(sub.as_ref(), last, max_fields, out);
        last.pop();
        last.pop();
    }

    let n = children.len();
    for (i, child) in children.into_iter().enumerate() {
        last.push(i + 1 == n);
        write_node(child.as_ref(), last, max_fields, out);
        last.pop();
    }
}

/// Join `items` with `sep`, keeping at most `max_fields` entries: longer
/// lists show `max_fields - 1` items then `... N more fields`.
pub fn truncated_join<I, S>(items: I, sep: &str, max_fields: usize) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let items: Vec<String> = items.into_iter().map(Into::into).collect();
    if items.len() <= max_fields {
        return items.join(sep);
    }
    let keep = max_fields.saturating_sub(1);
    let mut parts: Vec<String> = items[..keep].to_vec();
    parts.push(format!("... {} more fields", items.len() - keep));
    parts.join(sep)
}

/// [`truncated_join`] with `", "` inside square brackets.
pub fn truncated_list<I, S>(items: I, max_fields: usize) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    format!("[{}]", truncated_join(items, ", ", max_fields))
}
