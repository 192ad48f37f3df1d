use std::collections::BTreeSet;

use crate::ast::{AttributeValue, Expression, Fragment, TemplateNode};
use crate::compiler::compile;
use crate::conversation::Conversation;
use crate::error::PromptlateResult;
use crate::params::Parameters;
use crate::parser::{ParseConfig, parse};

/// A Template is a prompt that has been parsed once and can be rendered any
/// number of times.
///
/// The parsed tree is never modified by a render, so a single template may be
/// shared between threads and rendered with different parameters
/// concurrently.
///
/// # Example
///
/// ```rust
/// use promptlate::{MessageRole, Parameters, Template};
///
/// let template = Template::new("<user>Hello, {{ name }}!</user>").unwrap();
///
/// let mut parameters = Parameters::new();
/// parameters.insert("name", "World");
///
/// let conversation = template.render(&parameters).unwrap();
/// assert_eq!(conversation.messages[0].role, MessageRole::User);
/// assert_eq!(conversation.messages[0].text(), "Hello, World!");
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Template {
    source: String,
    config: ParseConfig,
    #[serde(skip)]
    fragment: Fragment,
}

impl<'de> serde::Deserialize<'de> for Template {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct TemplateHelper {
            source: String,
            #[serde(default)]
            config: ParseConfig,
        }

        let helper = TemplateHelper::deserialize(deserializer)?;

        // The tree is rebuilt from source rather than trusted from the wire.
        Template::with_config(helper.source, helper.config)
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse template: {}", e)))
    }
}

impl Template {
    /// Parses `source` with the default `{{ }}` delimiters.
    ///
    /// # Errors
    ///
    /// Returns the syntax error if the template is malformed.
    pub fn new<T: Into<String>>(source: T) -> PromptlateResult<Self> {
        Self::with_config(source, ParseConfig::default())
    }

    /// Parses `source` with custom parser options.
    ///
    /// # Errors
    ///
    /// Returns the syntax error if the template is malformed, or
    /// `invalid-config` if the delimiters are unusable.
    pub fn with_config<T: Into<String>>(source: T, config: ParseConfig) -> PromptlateResult<Self> {
        let source = source.into();
        let fragment = parse(&source, &config)?;
        Ok(Self {
            source,
            config,
            fragment,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn fragment(&self) -> &Fragment {
        &self.fragment
    }

    /// Names of the parameters this template reads.
    ///
    /// ```
    /// use promptlate::Template;
    ///
    /// let template =
    ///     Template::new("{{ for doc in docs }}{{ doc.title }} by {{ author }}{{ endfor }}").unwrap();
    /// let names: Vec<_> = template.referenced_parameters().into_iter().collect();
    /// assert_eq!(names, vec!["author", "docs"]);
    /// ```
    pub fn referenced_parameters(&self) -> BTreeSet<String> {
        self.fragment.referenced_parameters()
    }

    /// Renders the template synchronously.
    ///
    /// # Errors
    ///
    /// Returns the first semantic error met during the walk; no partial
    /// conversation is produced.
    pub fn render(&self, parameters: &Parameters) -> PromptlateResult<Conversation> {
        compile(&self.fragment, parameters)
    }
}

impl Fragment {
    /// Collects the root identifiers referenced anywhere in the tree, without
    /// rendering it.
    ///
    /// Names bound by an enclosing `for` block are not parameters and are
    /// skipped where they are in scope.
    pub fn referenced_parameters(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let mut bound = Vec::new();
        collect_from_nodes(&self.children, &mut bound, &mut names);
        names
    }
}

fn collect_from_nodes<'a>(
    nodes: &'a [TemplateNode],
    bound: &mut Vec<&'a str>,
    names: &mut BTreeSet<String>,
) {
    for node in nodes {
        collect_from_node(node, bound, names);
    }
}

fn collect_from_node<'a>(
    node: &'a TemplateNode,
    bound: &mut Vec<&'a str>,
    names: &mut BTreeSet<String>,
) {
    match node {
        TemplateNode::Text(_) | TemplateNode::Comment(_) | TemplateNode::Config(_) => {}
        TemplateNode::MustacheTag(tag) => collect_from_expression(&tag.expression, bound, names),
        TemplateNode::ElementTag(tag) => {
            for attribute in &tag.attributes {
                match &attribute.value {
                    AttributeValue::True => {}
                    AttributeValue::Expression(expression) => {
                        collect_from_expression(expression, bound, names);
                    }
                    AttributeValue::Nodes(nodes) => collect_from_nodes(nodes, bound, names),
                }
            }
            collect_from_nodes(&tag.children, bound, names);
        }
        TemplateNode::IfBlock(block) => {
            collect_from_expression(&block.expression, bound, names);
            collect_from_nodes(&block.children, bound, names);
            if let Some(else_block) = &block.else_block {
                collect_from_nodes(&else_block.children, bound, names);
            }
        }
        TemplateNode::ForBlock(block) => {
            // The iterable is evaluated outside the loop's own bindings.
            collect_from_expression(&block.expression, bound, names);
            if let Some(else_block) = &block.else_block {
                collect_from_nodes(&else_block.children, bound, names);
            }

            let depth = bound.len();
            bound.push(&block.context.name);
            if let Some(index) = &block.index {
                bound.push(&index.name);
            }
            collect_from_nodes(&block.children, bound, names);
            bound.truncate(depth);
        }
    }
}

fn collect_from_expression(
    expression: &Expression,
    bound: &[&str],
    names: &mut BTreeSet<String>,
) {
    match expression {
        Expression::Identifier(ident) => {
            if !bound.contains(&ident.name.as_str()) {
                names.insert(ident.name.clone());
            }
        }
        Expression::Literal { .. } => {}
        Expression::BinaryExpression { left, right, .. } => {
            collect_from_expression(left, bound, names);
            collect_from_expression(right, bound, names);
        }
        Expression::UnaryExpression { argument, .. } => {
            collect_from_expression(argument, bound, names);
        }
        Expression::MemberExpression {
            object,
            property,
            computed,
            ..
        } => {
            collect_from_expression(object, bound, names);
            // `a.b` names a property, `a[b]` reads `b` from scope.
            if *computed {
                collect_from_expression(property, bound, names);
            }
        }
        Expression::ConditionalExpression {
            test,
            consequent,
            alternate,
        } => {
            collect_from_expression(test, bound, names);
            collect_from_expression(consequent, bound, names);
            collect_from_expression(alternate, bound, names);
        }
        Expression::ArrayExpression { elements } => {
            for element in elements {
                collect_from_expression(element, bound, names);
            }
        }
        Expression::ObjectExpression { properties } => {
            for (_, value) in properties {
                collect_from_expression(value, bound, names);
            }
        }
    }
}
