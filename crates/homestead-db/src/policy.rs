//! Row-level-security policy model.
//!
//! A [`PolicySet`] maps each operation to one predicate. Planning against the
//! policies currently installed yields the drops and creates that leave exactly
//! one policy per operation; all drops run before any create.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::schema::{quote_ident, quote_literal};

/// Operation kinds a policy can govern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Select,
        Operation::Insert,
        Operation::Update,
        Operation::Delete,
    ];

    /// Command keyword as written in `CREATE POLICY .. FOR <cmd>` and `pg_policies.cmd`.
    pub fn command(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Whether a policy with `pg_policies.cmd = command` applies to this operation.
    pub fn governed_by(self, command: &str) -> bool {
        let command = command.trim();
        command.eq_ignore_ascii_case(self.command())
            || command.eq_ignore_ascii_case("ALL")
            || command == "*"
    }

    // INSERT policies only accept WITH CHECK; the others are written with USING.
    fn uses_with_check(self) -> bool {
        matches!(self, Self::Insert)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command().to_ascii_lowercase())
    }
}

/// Who an operation is granted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// Constant true: open to every caller.
    Public,
    /// Restricted to callers for which `public.is_admin()` holds.
    Admin,
}

impl Predicate {
    pub fn expression(self) -> &'static str {
        match self {
            Self::Public => "true",
            Self::Admin => "public.is_admin()",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Admin => "admin",
        }
    }
}

/// A desired policy on one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub name: String,
    pub operation: Operation,
    pub predicate: Predicate,
}

impl PolicyRule {
    pub fn create_sql(&self, table: &str) -> String {
        let clause = if self.operation.uses_with_check() {
            "WITH CHECK"
        } else {
            "USING"
        };
        format!(
            "CREATE POLICY {} ON public.{} FOR {} {clause} ({})",
            quote_ident(&self.name),
            quote_ident(table),
            self.operation.command(),
            self.predicate.expression()
        )
    }

    fn matches(&self, existing: &ExistingPolicy) -> bool {
        let (expr, unused) = if self.operation.uses_with_check() {
            (&existing.with_check, &existing.qual)
        } else {
            (&existing.qual, &existing.with_check)
        };
        existing.name == self.name
            && existing.command.trim().eq_ignore_ascii_case(self.operation.command())
            && unused.is_none()
            && expr.as_deref().map(normalize_expression)
                == Some(normalize_expression(self.predicate.expression()))
    }
}

/// A policy as reported by `pg_policies`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingPolicy {
    pub name: String,
    pub command: String,
    pub qual: Option<String>,
    pub with_check: Option<String>,
}

/// Mapping from operation to predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    rules: BTreeMap<Operation, Predicate>,
}

impl PolicySet {
    pub fn new(rules: impl IntoIterator<Item = (Operation, Predicate)>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    /// Anyone may read; only admins may insert, update or delete.
    pub fn admin_writes() -> Self {
        Self::new([
            (Operation::Select, Predicate::Public),
            (Operation::Insert, Predicate::Admin),
            (Operation::Update, Predicate::Admin),
            (Operation::Delete, Predicate::Admin),
        ])
    }

    /// Every operation open; writes are then limited only by which API key the caller holds.
    pub fn open() -> Self {
        Self::new(Operation::ALL.map(|op| (op, Predicate::Public)))
    }

    pub fn requires_admin_function(&self) -> bool {
        self.rules.values().any(|p| *p == Predicate::Admin)
    }

    /// Named rules for `table`, in operation order.
    pub fn rules(&self, table: &str) -> Vec<PolicyRule> {
        self.rules
            .iter()
            .map(|(&operation, &predicate)| PolicyRule {
                name: format!("{table}_{operation}_{}", predicate.label()),
                operation,
                predicate,
            })
            .collect()
    }

    /// Compute the changes that leave exactly one matching policy per operation.
    pub fn plan(&self, table: &str, existing: &[ExistingPolicy]) -> PolicyPlan {
        let mut plan = PolicyPlan::default();
        let mut drops = BTreeSet::new();

        for rule in self.rules(table) {
            let governing: Vec<&ExistingPolicy> = existing
                .iter()
                .filter(|p| rule.operation.governed_by(&p.command))
                .collect();

            if let [only] = governing.as_slice() {
                if rule.matches(only) {
                    plan.unchanged.push(rule.operation);
                    continue;
                }
            }

            drops.extend(governing.iter().map(|p| p.name.clone()));
            plan.creates.push(rule);
        }

        // A policy name is unique per table, so free the names about to be reused.
        for rule in &plan.creates {
            if existing.iter().any(|p| p.name == rule.name) {
                drops.insert(rule.name.clone());
            }
        }

        plan.drops = drops.into_iter().collect();
        plan
    }
}

/// Changes needed to reach the desired policy set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyPlan {
    /// Existing policy names to drop, applied first.
    pub drops: Vec<String>,
    /// Rules to create once every drop has run.
    pub creates: Vec<PolicyRule>,
    pub unchanged: Vec<Operation>,
}

impl PolicyPlan {
    pub fn is_empty(&self) -> bool {
        self.drops.is_empty() && self.creates.is_empty()
    }
}

pub fn drop_policy_sql(table: &str, name: &str) -> String {
    format!(
        "DROP POLICY IF EXISTS {} ON public.{}",
        quote_ident(name),
        quote_ident(table)
    )
}

/// `public.is_admin()`: true for JWTs with `user_metadata.role = 'admin'`, or
/// for the configured admin email.
///
/// Written in plpgsql so the body is only resolved when called; `auth.jwt()`
/// exists on the hosted service but not on a plain Postgres.
pub fn admin_function_sql(admin_email: Option<&str>) -> String {
    let email_check = admin_email
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|email| {
            format!(
                "\n      OR coalesce(auth.jwt() ->> 'email', '') = {}",
                quote_literal(email)
            )
        })
        .unwrap_or_default();

    format!(
        "CREATE OR REPLACE FUNCTION public.is_admin()\n\
         RETURNS BOOLEAN\n\
         LANGUAGE plpgsql\n\
         STABLE\n\
         SECURITY DEFINER\n\
         SET search_path = public\n\
         AS $$\n\
         BEGIN\n  \
           RETURN coalesce(auth.jwt() -> 'user_metadata' ->> 'role', '') = 'admin'{email_check};\n\
         END;\n\
         $$"
    )
}

/// Compare policy expressions the way Postgres deparses them: no whitespace,
/// no redundant parentheses, no `public.` qualifier, case-insensitive.
fn normalize_expression(expr: &str) -> String {
    expr.chars()
        .filter(|c| !c.is_whitespace() && *c != '(' && *c != ')')
        .collect::<String>()
        .to_ascii_lowercase()
        .replace("public.", "")
}
