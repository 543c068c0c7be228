//! Permission catalog and the built-in role mapping.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;

use crate::identity::SystemRole;

pub mod names {
    pub const USERS_VIEW: &str = "users.view";
    pub const USERS_CREATE: &str = "users.create";
    pub const USERS_EDIT: &str = "users.edit";
    pub const USERS_DELETE: &str = "users.delete";
    pub const USERS_VIEW_ALL: &str = "users.view_all";
    pub const USERS_MANAGE_ROLES: &str = "users.manage_roles";
    pub const USERS_VIEW_REPORTS: &str = "users.view_reports";

    pub const SYSTEM_VIEW_ADMIN_PANEL: &str = "system.view_admin_panel";
    pub const SYSTEM_MANAGE_SETTINGS: &str = "system.manage_settings";
    pub const SYSTEM_VIEW_LOGS: &str = "system.view_logs";
    pub const SYSTEM_SYNC_DATA: &str = "system.sync_data";
    pub const SYSTEM_VIEW_STATISTICS: &str = "system.view_statistics";

    pub const DATA_EXPORT: &str = "data.export";
    pub const DATA_IMPORT: &str = "data.import";
    pub const DATA_BACKUP: &str = "data.backup";
    pub const DATA_RESTORE: &str = "data.restore";

    pub const INVOICE_VIEW: &str = "invoice.view";
    pub const INVOICE_CREATE: &str = "invoice.create";
    pub const INVOICE_EDIT: &str = "invoice.edit";
    pub const INVOICE_DELETE: &str = "invoice.delete";
    pub const INVOICE_VIEW_ALL: &str = "invoice.view_all";
    pub const INVOICE_MANAGE_ITEMS: &str = "invoice.manage_items";

    pub const PRODUCT_VIEW: &str = "product.view";
    pub const PRODUCT_CREATE: &str = "product.create";
    pub const PRODUCT_EDIT: &str = "product.edit";
    pub const PRODUCT_DELETE: &str = "product.delete";
    pub const PRODUCT_UPDATE_STOCK: &str = "product.update_stock";
    pub const PRODUCT_VIEW_REPORTS: &str = "product.view_reports";

    pub const REPORTS_VIEW_BASIC: &str = "reports.view_basic";
    pub const REPORTS_VIEW_ADVANCED: &str = "reports.view_advanced";
    pub const REPORTS_GENERATE: &str = "reports.generate";
    pub const REPORTS_SCHEDULE: &str = "reports.schedule";
}

pub use names::*;

/// Catalog entry returned by the permissions endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PermissionInfo {
    pub name: &'static str,
    pub category: &'static str,
    pub description: &'static str,
}

const fn entry(
    name: &'static str,
    category: &'static str,
    description: &'static str,
) -> PermissionInfo {
    PermissionInfo {
        name,
        category,
        description,
    }
}

pub const CATALOG: &[PermissionInfo] = &[
    entry(USERS_VIEW, "users", "View own profile"),
    entry(USERS_CREATE, "users", "Create user accounts"),
    entry(USERS_EDIT, "users", "Edit user profiles"),
    entry(USERS_DELETE, "users", "Deactivate user accounts"),
    entry(USERS_VIEW_ALL, "users", "List and inspect all users"),
    entry(USERS_MANAGE_ROLES, "users", "Assign roles and edit role permissions"),
    entry(USERS_VIEW_REPORTS, "users", "View user reports"),
    entry(SYSTEM_VIEW_ADMIN_PANEL, "system", "Open the administration panel"),
    entry(SYSTEM_MANAGE_SETTINGS, "system", "Change system settings and broadcast notices"),
    entry(SYSTEM_VIEW_LOGS, "system", "Read the audit stream"),
    entry(SYSTEM_SYNC_DATA, "system", "Trigger data synchronisation"),
    entry(SYSTEM_VIEW_STATISTICS, "system", "View system statistics"),
    entry(DATA_EXPORT, "data", "Export data"),
    entry(DATA_IMPORT, "data", "Import data"),
    entry(DATA_BACKUP, "data", "Create backups"),
    entry(DATA_RESTORE, "data", "Restore backups"),
    entry(INVOICE_VIEW, "invoice", "View own invoices"),
    entry(INVOICE_CREATE, "invoice", "Create invoices"),
    entry(INVOICE_EDIT, "invoice", "Edit invoices"),
    entry(INVOICE_DELETE, "invoice", "Delete invoices"),
    entry(INVOICE_VIEW_ALL, "invoice", "View all invoices"),
    entry(INVOICE_MANAGE_ITEMS, "invoice", "Manage invoice line items"),
    entry(PRODUCT_VIEW, "product", "View products"),
    entry(PRODUCT_CREATE, "product", "Create products"),
    entry(PRODUCT_EDIT, "product", "Edit products"),
    entry(PRODUCT_DELETE, "product", "Delete products"),
    entry(PRODUCT_UPDATE_STOCK, "product", "Adjust stock levels and receive stock alerts"),
    entry(PRODUCT_VIEW_REPORTS, "product", "View inventory statistics"),
    entry(REPORTS_VIEW_BASIC, "reports", "View basic reports"),
    entry(REPORTS_VIEW_ADVANCED, "reports", "View advanced reports"),
    entry(REPORTS_GENERATE, "reports", "Generate reports"),
    entry(REPORTS_SCHEDULE, "reports", "Schedule reports"),
];

const USER_PERMISSIONS: &[&str] = &[USERS_VIEW, USERS_EDIT, PRODUCT_VIEW, REPORTS_VIEW_BASIC];

const MANAGER_PERMISSIONS: &[&str] = &[
    USERS_VIEW,
    USERS_EDIT,
    USERS_VIEW_ALL,
    USERS_VIEW_REPORTS,
    PRODUCT_VIEW,
    PRODUCT_CREATE,
    PRODUCT_EDIT,
    PRODUCT_UPDATE_STOCK,
    PRODUCT_VIEW_REPORTS,
    INVOICE_VIEW,
    INVOICE_CREATE,
    INVOICE_EDIT,
    INVOICE_VIEW_ALL,
    INVOICE_MANAGE_ITEMS,
    SYSTEM_VIEW_STATISTICS,
    REPORTS_VIEW_BASIC,
    REPORTS_VIEW_ADVANCED,
    REPORTS_GENERATE,
    DATA_EXPORT,
];

pub fn all() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|info| info.name)
}

pub fn is_known(name: &str) -> bool {
    CATALOG.iter().any(|info| info.name == name)
}

/// Permissions granted to a built-in role on first start.
pub fn default_permissions(role: SystemRole) -> Vec<&'static str> {
    match role {
        SystemRole::User => USER_PERMISSIONS.to_vec(),
        SystemRole::Manager => MANAGER_PERMISSIONS.to_vec(),
        SystemRole::Admin => all().collect(),
    }
}

/// Effective permissions of an authenticated principal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet(HashSet<String>);

impl PermissionSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn contains_any(&self, names: &[&str]) -> bool {
        names.iter().any(|name| self.contains(name))
    }

    pub fn require(&self, name: &'static str) -> Result<(), PermissionDenied> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(PermissionDenied(name))
        }
    }

    /// Sorted names, for stable responses.
    pub fn to_sorted_vec(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("missing permission {0}")]
pub struct PermissionDenied(pub &'static str);
