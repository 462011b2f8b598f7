//! Static code tables for nationalities, countries, and team display names.

/// Nationality demonym to `(alpha-2, alpha-3)` country codes.
pub fn nationality_codes(nationality: &str) -> Option<(&'static str, &'static str)> {
    let codes = match nationality.trim() {
        "American" => ("US", "USA"),
        "Argentine" => ("AR", "ARG"),
        "Australian" => ("AU", "AUS"),
        "Austrian" => ("AT", "AUT"),
        "Belgian" => ("BE", "BEL"),
        "Brazilian" => ("BR", "BRA"),
        "British" => ("GB", "GBR"),
        "Canadian" => ("CA", "CAN"),
        "Chinese" => ("CN", "CHN"),
        "Danish" => ("DK", "DNK"),
        "Dutch" => ("NL", "NLD"),
        "Finnish" => ("FI", "FIN"),
        "French" => ("FR", "FRA"),
        "German" => ("DE", "DEU"),
        "Italian" => ("IT", "ITA"),
        "Japanese" => ("JP", "JPN"),
        "Mexican" => ("MX", "MEX"),
        "Monegasque" => ("MC", "MCO"),
        "New Zealander" => ("NZ", "NZL"),
        "Polish" => ("PL", "POL"),
        "Russian" => ("RU", "RUS"),
        "Spanish" => ("ES", "ESP"),
        "Swedish" => ("SE", "SWE"),
        "Swiss" => ("CH", "CHE"),
        "Thai" => ("TH", "THA"),
        _ => return None,
    };
    Some(codes)
}

/// Country name, as the calendar spells it, to its alpha-2 code.
pub fn country_alpha2(country: &str) -> Option<&'static str> {
    let code = match country.trim() {
        "Australia" => "AU",
        "Austria" => "AT",
        "Azerbaijan" => "AZ",
        "Bahrain" => "BH",
        "Belgium" => "BE",
        "Brazil" => "BR",
        "Canada" => "CA",
        "China" => "CN",
        "Hungary" => "HU",
        "Italy" => "IT",
        "Japan" => "JP",
        "Mexico" => "MX",
        "Monaco" => "MC",
        "Netherlands" => "NL",
        "Qatar" => "QA",
        "Saudi Arabia" => "SA",
        "Singapore" => "SG",
        "Spain" => "ES",
        "UAE" | "United Arab Emirates" => "AE",
        "UK" | "United Kingdom" => "GB",
        "USA" | "United States" => "US",
        _ => return None,
    };
    Some(code)
}

/// Marketing name for a constructor id. Unknown ids fall back to the provider's own name.
pub fn team_display_name<'a>(constructor_id: &str, provider_name: &'a str) -> &'a str {
    match constructor_id {
        "red_bull" => "Red Bull Racing",
        "mclaren" => "McLaren",
        "ferrari" => "Ferrari",
        "mercedes" => "Mercedes",
        "aston_martin" => "Aston Martin",
        "alpine" => "Alpine",
        "williams" => "Williams",
        "rb" => "Racing Bulls",
        "sauber" => "Kick Sauber",
        "haas" => "Haas F1 Team",
        _ => provider_name,
    }
}
