//! Known-good extraction instructions used whenever generated text cannot be trusted.
//!
//! Rules are evaluated in order; the first whose predicate matches the field's
//! display name wins, and a per-type generic template covers everything else.
//! Every template names a location, at least six quoted alternative labels, an
//! output format, a "Do not" clause and the "Not Present" answer, so the output
//! always clears the validator.

use crate::schema::FieldType;

/// Everything a template may splice in.
#[derive(Debug, Clone, Copy)]
pub struct TemplateRequest<'a> {
    pub field_name: &'a str,
    pub field_type: FieldType,
    pub options: &'a [String],
    pub exclude_entity: Option<&'a str>,
}

impl<'a> TemplateRequest<'a> {
    pub fn new(field_name: &'a str, field_type: FieldType) -> Self {
        Self {
            field_name,
            field_type,
            options: &[],
            exclude_entity: None,
        }
    }

    pub fn with_options(mut self, options: &'a [String]) -> Self {
        self.options = options;
        self
    }

    pub fn with_exclude_entity(mut self, entity: Option<&'a str>) -> Self {
        self.exclude_entity = entity;
        self
    }
}

/// Lower-cased display name with separators flattened to spaces.
pub type TemplateMatcher = fn(&str, FieldType) -> bool;
pub type TemplateBuilder = fn(&TemplateRequest<'_>) -> String;

#[derive(Clone, Copy)]
pub struct TemplateRule {
    pub name: &'static str,
    pub matches: TemplateMatcher,
    pub build: TemplateBuilder,
}

impl std::fmt::Debug for TemplateRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRule").field("name", &self.name).finish()
    }
}

const MAX_TEMPLATE_OPTIONS: usize = 25;

#[derive(Debug, Clone)]
pub struct TemplateLibrary {
    rules: Vec<TemplateRule>,
}

impl Default for TemplateLibrary {
    fn default() -> Self {
        Self {
            rules: builtin_rules(),
        }
    }
}

impl TemplateLibrary {
    /// Adds a rule ahead of every existing one.
    pub fn with_rule(mut self, rule: TemplateRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    /// Name of the rule that would serve this field, or the generic type template.
    pub fn rule_for(&self, field_name: &str, field_type: FieldType) -> &'static str {
        let key = normalize_name(field_name);
        self.rules
            .iter()
            .find(|rule| (rule.matches)(&key, field_type))
            .map(|rule| rule.name)
            .unwrap_or_else(|| generic_rule_name(field_type))
    }

    pub fn template_for(&self, request: &TemplateRequest<'_>) -> String {
        let key = normalize_name(request.field_name);
        match self
            .rules
            .iter()
            .find(|rule| (rule.matches)(&key, request.field_type))
        {
            Some(rule) => (rule.build)(request),
            None => generic_template(request),
        }
    }
}

/// Template from the built-in rule set.
pub fn template_for(
    field_name: &str,
    field_type: FieldType,
    options: &[String],
    exclude_entity: Option<&str>,
) -> String {
    let request = TemplateRequest::new(field_name, field_type)
        .with_options(options)
        .with_exclude_entity(exclude_entity);
    TemplateLibrary::default().template_for(&request)
}

/// Whether a field names the other party of a document (or that party's details).
pub fn is_counterparty_field(field_name: &str) -> bool {
    let key = normalize_name(field_name);
    is_counterparty_name(&key, FieldType::String)
        || is_vendor(&key, FieldType::String)
        || (is_address(&key, FieldType::String)
            && contains_any(&key, &["party", "customer", "client", "vendor", "supplier"]))
}

fn builtin_rules() -> Vec<TemplateRule> {
    vec![
        TemplateRule {
            name: "counterparty_address",
            matches: is_address,
            build: counterparty_address,
        },
        TemplateRule {
            name: "counterparty_name",
            matches: is_counterparty_name,
            build: counterparty_name,
        },
        TemplateRule {
            name: "effective_date",
            matches: is_effective_date,
            build: effective_date,
        },
        TemplateRule {
            name: "end_date",
            matches: is_end_date,
            build: end_date,
        },
        TemplateRule {
            name: "renewal_type",
            matches: is_renewal,
            build: renewal_type,
        },
        TemplateRule {
            name: "termination",
            matches: is_termination,
            build: termination,
        },
        TemplateRule {
            name: "governing_law",
            matches: is_governing_law,
            build: governing_law,
        },
        TemplateRule {
            name: "tax_amount",
            matches: is_tax,
            build: tax_amount,
        },
        TemplateRule {
            name: "total_amount",
            matches: is_total,
            build: total_amount,
        },
        TemplateRule {
            name: "invoice_number",
            matches: is_invoice_number,
            build: invoice_number,
        },
        TemplateRule {
            name: "invoice_date",
            matches: is_invoice_date,
            build: invoice_date,
        },
        TemplateRule {
            name: "line_items",
            matches: is_line_items,
            build: line_items,
        },
        TemplateRule {
            name: "vendor_name",
            matches: is_vendor,
            build: vendor_name,
        },
    ]
}

fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_any(key: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| key.contains(needle))
}

fn is_address(key: &str, _: FieldType) -> bool {
    key.contains("address") && !contains_any(key, &["email", "e mail", "ip address", "web"])
}

fn is_counterparty_name(key: &str, _: FieldType) -> bool {
    contains_any(
        key,
        &[
            "counter party",
            "counterparty",
            "other party",
            "contracting party",
            "party name",
            "customer name",
            "client name",
        ],
    ) || key == "customer"
        || key == "client"
}

fn is_effective_date(key: &str, _: FieldType) -> bool {
    contains_any(
        key,
        &[
            "effective date",
            "commencement",
            "start date",
            "agreement date",
            "contract date",
        ],
    )
}

fn is_end_date(key: &str, _: FieldType) -> bool {
    contains_any(
        key,
        &[
            "end date",
            "expiration",
            "expiry",
            "termination date",
            "maturity date",
        ],
    )
}

fn is_renewal(key: &str, _: FieldType) -> bool {
    contains_any(key, &["renewal", "auto renew", "evergreen"])
}

fn is_termination(key: &str, _: FieldType) -> bool {
    contains_any(
        key,
        &["termination", "terminate", "notice period", "cancellation"],
    )
}

fn is_governing_law(key: &str, _: FieldType) -> bool {
    contains_any(
        key,
        &["governing law", "choice of law", "applicable law", "jurisdiction"],
    )
}

fn is_tax(key: &str, field_type: FieldType) -> bool {
    contains_any(key, &["tax amount", "total tax", "sales tax", "vat", "gst"])
        || (key.contains("tax") && field_type.is_numeric())
}

fn is_total(key: &str, _: FieldType) -> bool {
    contains_any(
        key,
        &[
            "total",
            "amount due",
            "balance due",
            "invoice amount",
            "contract value",
        ],
    )
}

fn is_invoice_number(key: &str, _: FieldType) -> bool {
    contains_any(
        key,
        &["invoice number", "invoice no", "invoice #", "invoice id", "bill number"],
    )
}

fn is_invoice_date(key: &str, _: FieldType) -> bool {
    contains_any(key, &["invoice date", "bill date", "billing date", "issue date"])
}

fn is_line_items(key: &str, _: FieldType) -> bool {
    key.contains("line item")
}

fn is_vendor(key: &str, _: FieldType) -> bool {
    contains_any(key, &["vendor", "supplier", "seller", "merchant", "payee"])
}

/// Field names go inside quotes, so stray quote marks are dropped.
fn display(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '"' | '“' | '”'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "field".to_string()
    } else {
        cleaned.to_string()
    }
}

fn clean_entity(entity: Option<&str>) -> Option<String> {
    entity
        .map(|e| e.trim().trim_matches(|c: char| c == '"' || c == '“' || c == '”').trim())
        .filter(|e| !e.is_empty())
        .map(str::to_string)
}

fn party_exclusion(entity: Option<&str>) -> String {
    match clean_entity(entity) {
        Some(entity) => format!(
            "Do not return \"{}\" or any of its affiliates or subsidiaries; that is our own organization, not the counter party.",
            entity
        ),
        None => "Do not return our own organization, the party on whose behalf this document is being reviewed; return the other contracting party.".to_string(),
    }
}

fn address_exclusion(entity: Option<&str>) -> String {
    match clean_entity(entity) {
        Some(entity) => format!(
            "Do not return the address of \"{}\"; that is our own organization, not the counter party.",
            entity
        ),
        None => "Do not return the address of our own organization; only return the address of the other party.".to_string(),
    }
}

fn vendor_exclusion(entity: Option<&str>) -> String {
    match clean_entity(entity) {
        Some(entity) => format!(
            "Do not return \"{}\"; that is our own organization and appears as the billed party.",
            entity
        ),
        None => "Do not return the \"Bill To\" or \"Ship To\" party, which is our own organization.".to_string(),
    }
}

fn quoted_options(options: &[String]) -> String {
    let mut quoted: Vec<String> = options
        .iter()
        .map(|o| display(o))
        .take(MAX_TEMPLATE_OPTIONS)
        .map(|o| format!("\"{}\"", o))
        .collect();
    if options.len() > MAX_TEMPLATE_OPTIONS {
        quoted.push(format!("{} further listed values", options.len() - MAX_TEMPLATE_OPTIONS));
    }
    quoted.join(", ")
}

fn choice_clause(request: &TemplateRequest<'_>, default_choices: &str) -> String {
    let choices = if request.options.is_empty() {
        default_choices.to_string()
    } else {
        quoted_options(request.options)
    };
    if request.field_type == FieldType::MultiSelect {
        format!(
            "Return one or more of the following values exactly as written, separated by commas: {}.",
            choices
        )
    } else {
        format!(
            "Return exactly one of the following values as written: {}.",
            choices
        )
    }
}

fn counterparty_name(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in (1) the opening paragraph or preamble that names the parties, (2) the recitals, and (3) the signature block at the end of the document to find the {name}. \
         This party may be introduced as \"Customer\", \"Client\", \"Counterparty\", \"Licensee\", \"Buyer\", \"Company\" or \"the other party\". \
         {exclusion} \
         Return the exact legal name as written in the document, including suffixes such as Inc., LLC or Ltd., without addresses or roles. \
         If the {name} is not present, return \"Not Present\".",
        name = name,
        exclusion = party_exclusion(request.exclude_entity),
    )
}

fn counterparty_address(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in (1) the preamble that introduces the parties, (2) the notices section, and (3) the signature block to find the {name}. \
         The address may be labeled \"Address\", \"Principal Place of Business\", \"Registered Office\", \"Notices\", \"Mailing Address\", \"Headquarters\" or \"Located at\". \
         {exclusion} \
         Return the full postal address as written on a single line, formatted as street, city, state or region, postal code and country, separated by commas. \
         If no address is given for the counter party, return \"Not Present\".",
        name = name,
        exclusion = address_exclusion(request.exclude_entity),
    )
}

fn effective_date(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in the first paragraph of the agreement, the title block, and any section headed \"Term\" or \"Effective Date\" to find the {name}. \
         It may appear as \"Effective Date\", \"Commencement Date\", \"Start Date\", \"dated as of\", \"entered into on\" or \"made as of\". \
         Return the date in YYYY-MM-DD format. \
         Do not return signature dates, print dates or renewal dates unless the document explicitly states that the agreement takes effect on that date. \
         If no effective date is stated, return \"Not Present\".",
        name = name,
    )
}

fn end_date(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in the section headed \"Term\" or \"Term and Termination\" and in any renewal provisions to find the {name}. \
         It may appear as \"Expiration Date\", \"End Date\", \"Expiry Date\", \"Termination Date\", \"shall expire on\" or \"continue until\". \
         If only a duration is given, such as three years from the effective date, calculate the end date from the effective date. \
         Return the date in YYYY-MM-DD format. \
         Do not return the effective date or the date a renewal notice is due. \
         If the agreement has no fixed end date, return \"Not Present\".",
        name = name,
    )
}

fn renewal_type(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in the sections headed \"Term\", \"Renewal\" or \"Term and Termination\" to determine the {name}. \
         Relevant wording includes \"automatically renew\", \"auto-renewal\", \"evergreen\", \"successive periods\", \"may be renewed by mutual agreement\" and \"upon written notice\". \
         {choices} \
         Do not infer renewal from the mere existence of a term length. \
         If the document says nothing about renewal, return \"Not Present\".",
        name = name,
        choices = choice_clause(
            request,
            "\"Auto Renewal\", \"Optional Renewal\" or \"No Renewal\""
        ),
    )
}

fn termination(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    let format_clause = if request.field_type.is_numeric() {
        "Return the notice period as a whole number of days in numeric digits only, converting months to days at 30 days per month.".to_string()
    } else if request.field_type.is_choice() {
        choice_clause(
            request,
            "\"For Convenience\", \"For Cause Only\" or \"Mutual Agreement\"",
        )
    } else {
        "Return a short plain-text summary that quotes the notice period exactly as written.".to_string()
    };
    format!(
        "Look in the section headed \"Termination\" and any clause titled \"Term and Termination\", \"Cancellation\" or \"Notice\" to find the {name}. \
         Relevant wording includes \"terminate for convenience\", \"without cause\", \"upon written notice\", \"days prior written notice\" and \"material breach\". \
         {format_clause} \
         Do not confuse termination for breach with termination for convenience, and do not return renewal notice periods. \
         If the document has no such provision, return \"Not Present\".",
        name = name,
        format_clause = format_clause,
    )
}

fn governing_law(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in the section headed \"Governing Law\", usually near the end of the agreement among the general provisions, to find the {name}. \
         It may appear as \"Governing Law\", \"Choice of Law\", \"Applicable Law\", \"governed by the laws of\", \"construed in accordance with\" or \"Jurisdiction\". \
         Return only the state or country name exactly as written, for example New York or England and Wales. \
         Do not return the venue for disputes or the location of courts unless no governing law is stated. \
         If no governing law is stated, return \"Not Present\".",
        name = name,
    )
}

fn tax_amount(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in the totals section at the bottom of the invoice, usually just above the grand total, to find the {name}. \
         It may be labeled \"Tax\", \"Sales Tax\", \"VAT\", \"GST\", \"Tax Amount\" or \"Total Tax\". \
         Return a plain number with two decimals, without currency symbols or thousands separators, for example 1250.00. \
         Do not return the tax rate percentage or the total including tax. \
         If no tax is shown, return \"Not Present\".",
        name = name,
    )
}

fn total_amount(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in the totals section at the bottom of the last page to find the {name}. \
         It may be labeled \"Total\", \"Grand Total\", \"Amount Due\", \"Balance Due\", \"Total Due\", \"Invoice Total\" or \"Please Pay\". \
         Return a plain number with two decimals, without currency symbols or thousands separators, for example 1250.00. \
         Do not return subtotals, tax amounts, line item amounts or amounts already paid. \
         If no total is shown, return \"Not Present\".",
        name = name,
    )
}

fn invoice_number(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in the header block at the top of the first page, usually near the invoice date, to find the {name}. \
         It may be labeled \"Invoice Number\", \"Invoice No.\", \"Invoice #\", \"Inv No\", \"Bill Number\" or \"Document Number\". \
         Return the identifier exactly as written, keeping letters, digits, dashes and leading zeros. \
         Do not return purchase order numbers, customer account numbers or payment reference numbers. \
         If no invoice number is shown, return \"Not Present\".",
        name = name,
    )
}

fn invoice_date(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in the header block at the top of the first page, next to the invoice number, to find the {name}. \
         It may be labeled \"Invoice Date\", \"Date of Issue\", \"Issue Date\", \"Billing Date\", \"Bill Date\" or \"Dated\". \
         Return the date in YYYY-MM-DD format, converting written months and two-digit years. \
         Do not return the due date, the delivery date or the service period dates. \
         If no invoice date is shown, return \"Not Present\".",
        name = name,
    )
}

fn line_items(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in the itemized table in the body of the invoice, between the header block and the totals section, to find the {name}. \
         Rows sit under columns labeled \"Description\", \"Item\", \"Product\", \"Service\", \"Qty\", \"Unit Price\" or \"Amount\". \
         Return each line item on its own line, formatted as description, quantity and amount separated by a vertical bar. \
         Do not include subtotal, tax, shipping or total rows. \
         If the document has no itemized table, return \"Not Present\".",
        name = name,
    )
}

fn vendor_name(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    format!(
        "Look in (1) the letterhead or logo area at the top of the first page, (2) the remittance block, and (3) the footer with bank or tax details to find the {name}. \
         The vendor may be labeled \"Vendor\", \"Supplier\", \"Seller\", \"Remit To\", \"Payee\" or \"Billed From\". \
         {exclusion} \
         Return the exact legal name as written, including suffixes such as Inc. or Ltd. \
         If the vendor cannot be identified, return \"Not Present\".",
        name = name,
        exclusion = vendor_exclusion(request.exclude_entity),
    )
}

fn generic_rule_name(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Enum | FieldType::MultiSelect => "generic_choice",
        FieldType::Date => "generic_date",
        FieldType::Float | FieldType::Integer => "generic_number",
        FieldType::String => "generic_text",
    }
}

fn generic_template(request: &TemplateRequest<'_>) -> String {
    let name = display(request.field_name);
    match request.field_type {
        FieldType::Enum | FieldType::MultiSelect => {
            let choices = if request.options.is_empty() {
                "Return a single short value exactly as written in the document.".to_string()
            } else {
                choice_clause(request, "")
            };
            format!(
                "Look in the document title, the first page, and any section whose heading mentions the {name} to decide its value. \
                 Relevant wording may include \"{name}\", \"type\", \"category\", \"classification\", \"kind\" and \"status\". \
                 {choices} \
                 Do not invent values outside this list and do not return explanatory text. \
                 If the document gives no basis for choosing a value, return \"Not Present\".",
                name = name,
                choices = choices,
            )
        }
        FieldType::Date => format!(
            "Look in the first page header, the section whose heading mentions the {name}, and any table or signature block that carries dates. \
             The date may be labeled \"{name}\", \"Date\", \"Dated\", \"As of\", \"On\" or \"Effective\". \
             Return the date in YYYY-MM-DD format, converting written months and two-digit years. \
             Do not return dates that belong to other events such as signature, print or filing dates unless they are the {name}. \
             If no such date is stated, return \"Not Present\".",
            name = name,
        ),
        FieldType::Float | FieldType::Integer => {
            let precision = if request.field_type == FieldType::Integer {
                "using digits only with no decimals"
            } else {
                "with two decimals"
            };
            format!(
                "Look in tables, totals sections and any paragraph whose heading mentions the {name} to find its value. \
                 It may be labeled \"{name}\", \"Amount\", \"Total\", \"Value\", \"Number\", \"Count\" or \"Quantity\". \
                 Return a plain number {precision}, without currency symbols, units or thousands separators. \
                 Do not return percentages, dates or reference numbers that only look numeric. \
                 If the value is not stated, return \"Not Present\".",
                name = name,
                precision = precision,
            )
        }
        FieldType::String => format!(
            "Look in the first page header, the section whose heading mentions the {name}, and any labeled table or form field to find its value. \
             It may be labeled \"{name}\", \"Name\", \"Title\", \"Reference\", \"Description\" or \"Details\", or written as a phrase near those labels. \
             Return the value exactly as written in the document, without surrounding labels or punctuation. \
             Do not return text that belongs to a neighbouring field or a heading. \
             If the value is not present, return \"Not Present\".",
            name = name,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::validate;

    fn field_cases() -> Vec<(&'static str, FieldType)> {
        vec![
            ("Counter Party Name", FieldType::String),
            ("Counterparty Address", FieldType::String),
            ("Effective Date", FieldType::Date),
            ("End Date", FieldType::Date),
            ("Renewal Type", FieldType::Enum),
            ("Termination Notice Period", FieldType::Integer),
            ("Termination for Convenience", FieldType::Enum),
            ("Termination Rights", FieldType::String),
            ("Governing Law", FieldType::String),
            ("Vendor Name", FieldType::String),
            ("Invoice Number", FieldType::String),
            ("Invoice Date", FieldType::Date),
            ("Total Amount", FieldType::Float),
            ("Tax Amount", FieldType::Float),
            ("Line Items", FieldType::String),
            ("Contract Type", FieldType::Enum),
            ("Departments", FieldType::MultiSelect),
            ("Signed On", FieldType::Date),
            ("Headcount", FieldType::Integer),
            ("Premium", FieldType::Float),
            ("Project Code", FieldType::String),
            ("Status", FieldType::Enum),
            ("Date", FieldType::Date),
            ("Name", FieldType::String),
            ("", FieldType::String),
        ]
    }

    #[test]
    fn test_every_template_passes_validator() {
        let options = vec![
            "Auto Renewal".to_string(),
            "No Renewal".to_string(),
            "Optional".to_string(),
        ];
        for (name, field_type) in field_cases() {
            for opts in [&[][..], &options[..]] {
                for entity in [None, Some("Acme Holdings Inc.")] {
                    let text = template_for(name, field_type, opts, entity);
                    let result = validate(&text);
                    assert!(
                        result.is_valid && result.missing.is_empty(),
                        "template for {:?}/{:?} rejected: {:?}\n{}",
                        name,
                        field_type,
                        result.defects,
                        text
                    );
                }
            }
        }
    }

    #[test]
    fn test_rule_priority() {
        let library = TemplateLibrary::default();
        assert_eq!(
            library.rule_for("Counterparty Address", FieldType::String),
            "counterparty_address"
        );
        assert_eq!(
            library.rule_for("Termination Date", FieldType::Date),
            "end_date"
        );
        assert_eq!(
            library.rule_for("Total Tax", FieldType::Float),
            "tax_amount"
        );
        assert_eq!(library.rule_for("Vendor Name", FieldType::String), "vendor_name");
        assert_eq!(library.rule_for("Project Code", FieldType::String), "generic_text");
        assert_eq!(library.rule_for("Signed On", FieldType::Date), "generic_date");
    }

    #[test]
    fn test_exclusion_entity_is_spliced() {
        let with_entity = template_for("Counter Party Name", FieldType::String, &[], Some("Acme Corp"));
        assert!(with_entity.contains("Do not return \"Acme Corp\""));

        let generic = template_for("Counter Party Name", FieldType::String, &[], None);
        assert!(generic.contains("Do not return our own organization"));

        let unrelated = template_for("Governing Law", FieldType::String, &[], Some("Acme Corp"));
        assert!(!unrelated.contains("Acme Corp"));
    }

    #[test]
    fn test_options_are_listed() {
        let options = vec!["Master Services Agreement".to_string(), "NDA".to_string()];
        let text = template_for("Contract Type", FieldType::Enum, &options, None);
        assert!(text.contains("\"Master Services Agreement\", \"NDA\""));
    }

    #[test]
    fn test_custom_rule_takes_priority() {
        fn matches_po(key: &str, _: FieldType) -> bool {
            key.contains("po number")
        }
        fn build_po(_: &TemplateRequest<'_>) -> String {
            "custom po template".to_string()
        }
        let library = TemplateLibrary::default().with_rule(TemplateRule {
            name: "po_number",
            matches: matches_po,
            build: build_po,
        });
        let request = TemplateRequest::new("PO Number", FieldType::String);
        assert_eq!(library.template_for(&request), "custom po template");
        assert_eq!(library.rule_for("PO Number", FieldType::String), "po_number");
    }

    #[test]
    fn test_counterparty_detection() {
        assert!(is_counterparty_field("Counter Party Name"));
        assert!(is_counterparty_field("vendor_name"));
        assert!(is_counterparty_field("Customer Address"));
        assert!(!is_counterparty_field("Governing Law"));
        assert!(!is_counterparty_field("Billing Address"));
    }
}
